//! Request-scoped identity and the headers that carry it past the gateway.
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeSet;
use tracing::warn;

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USERNAME: HeaderName = HeaderName::from_static("x-username");
pub const X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");
pub const X_USER_PERMS: HeaderName = HeaderName::from_static("x-user-perms");
pub const X_INTERNAL_TOKEN: HeaderName = HeaderName::from_static("x-internal-token");

const IDENTITY_HEADERS: [HeaderName; 5] = [
    X_USER_ID,
    X_USERNAME,
    X_USER_ROLES,
    X_USER_PERMS,
    X_INTERNAL_TOKEN,
];

/// The authenticated caller of one request. Built once per request, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Rebuild from identity headers set by the gateway. `None` when the user id is absent.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let user_id = header_str(headers, &X_USER_ID)?.trim();
        if user_id.is_empty() {
            return None;
        }

        Some(Self {
            user_id: user_id.to_string(),
            username: header_str(headers, &X_USERNAME)
                .unwrap_or_default()
                .to_string(),
            roles: split_list(header_str(headers, &X_USER_ROLES).unwrap_or_default()),
            permissions: split_list(header_str(headers, &X_USER_PERMS).unwrap_or_default()),
        })
    }
}

/// Drop every identity header a client may have supplied.
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    for name in &IDENTITY_HEADERS {
        headers.remove(name);
    }
}

/// Attach the gateway-transit header and, for authenticated requests, the caller's identity.
///
/// Client-supplied identity headers are always removed first.
pub fn attach_identity_headers(
    headers: &mut HeaderMap,
    principal: Option<&Principal>,
    internal_secret: &HeaderValue,
) {
    strip_identity_headers(headers);
    headers.insert(X_INTERNAL_TOKEN, internal_secret.clone());

    let Some(principal) = principal else {
        return;
    };

    let pairs = [
        (X_USER_ID, principal.user_id.clone()),
        (X_USERNAME, principal.username.clone()),
        (X_USER_ROLES, join_list(&principal.roles)),
        (X_USER_PERMS, join_list(&principal.permissions)),
    ];
    for (name, value) in pairs {
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                headers.insert(name, v);
            }
            Err(_) => warn!(header = %name, "identity value is not a valid header value, omitted"),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_list(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
