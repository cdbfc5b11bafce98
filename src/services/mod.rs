pub mod commit;
pub mod digest;
pub mod error;
pub mod grants;
pub mod registry;
pub mod session;
pub mod sweeper;
pub mod upload_service;
pub mod validator;

pub use error::UploadError;
pub use upload_service::UploadService;
