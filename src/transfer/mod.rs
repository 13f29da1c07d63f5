pub mod downloader;
pub mod session;
pub mod uploader;

pub use downloader::{Downloader, TransferReport};
pub use session::{ChunkVerdict, FileTransferSession, SessionState};
pub use uploader::{UploadOutcome, Uploader};
