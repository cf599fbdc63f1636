pub mod api_rule_repo;
pub mod error;
pub mod user_repo;

pub use api_rule_repo::{ApiRule, MethodSet, RuleSource, ValkeyRuleRepo};
pub use error::{RepoError, RepoResult};
pub use user_repo::{UserDirectory, UserRecord, ValkeyUserRepo};
