mod autohold;
mod build_request;
mod nodeset;
mod params;
mod repo_state;
mod result;

pub use autohold::AutoholdRequest;
pub use build_request::{BuildRequest, BuildRequestState, WorkerInfo};
pub use nodeset::{Group, Node, NodeSet};
pub use params::{BuildParams, MergeItem, PlaybookSpec, ProjectSpec, RoleSpec, SecretSpec, VarMap};
pub use repo_state::RepoState;
pub use result::{BuildCompletedEvent, BuildResult, ResultKind};
