pub mod types;
pub mod crypto;
pub mod error;
pub mod validator;
pub mod online_proof;
pub mod timing;

pub use types::*;
pub use crypto::*;
pub use error::*;
pub use validator::*;
pub use online_proof::*;
pub use timing::*;
