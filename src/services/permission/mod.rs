pub mod match_cache;
pub mod sync;
pub mod table;

pub use match_cache::{AllowedRoles, MatchResultCache};
pub use sync::{PermissionReloader, ReloadError, spawn_periodic_resync, spawn_sync_listener};
pub use table::{PermissionSnapshot, PermissionTable};
