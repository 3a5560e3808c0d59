mod models;
mod repo_type;

pub use models::{
    Commit, File, LfsObjectHistory, OrgRole, Repository, StagingUpload, Token, User,
    UserOrganization,
};
pub use repo_type::RepoType;
