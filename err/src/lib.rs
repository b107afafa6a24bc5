#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not implemented")]
    Unimplemented,
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Permission denied")]
    PermissionDenied,
    #[error("IO: {0}")]
    Io(IoError),
    #[error("Device: {0}")]
    Device(DeviceError),
    #[error("Partition map: {0}")]
    PartMap(PartMapError),
    #[error("FS: {0}")]
    Fs(FsError),
    #[error("Image: {0}")]
    Image(ImageError),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("Read-only")]
    ReadOnly,
    #[error(transparent)]
    Std(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("Read-only media")]
    ReadOnlyMedia,
    #[error("Access out of window bounds")]
    OutOfBounds,
    #[error("Unable to determine device geometry")]
    GeometryUnavailable,
}

#[derive(thiserror::Error, Debug)]
pub enum PartMapError {
    #[error("Signature mismatch")]
    Signature,
    #[error("Header checksum mismatch")]
    HeaderChecksum,
    #[error("Partition entry array checksum mismatch")]
    EntryArrayChecksum,
    #[error("No partition map found")]
    NotFound,
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("Inconsistent")]
    Inconsistent,
    #[error("Index")]
    Index,
    #[error("Block checksum mismatch")]
    BlockChecksum,
    #[error("Chunk-info address blocks are not supported")]
    ChunkInfoAddressBlock,
}

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("Signature mismatch")]
    Signature,
    #[error("Header checksum mismatch")]
    HeaderChecksum,
    #[error("Log replay found a torn write")]
    LogTorn,
    #[error("Image is full")]
    Full,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(IoError::Std(err))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
