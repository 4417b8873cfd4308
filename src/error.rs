use gstreamer::glib::{ BoolError, Error as GlibError };
use gstreamer::StateChangeError;
use image::ImageError;
use serde_json::Error as ConfigError;
use tensorflow::Status;

use std::error::Error;
use std::fmt;
use std::io::Error as IOError;

#[derive(Debug)]
pub struct LprError(LprErrorKind);

#[derive(Debug)]
pub enum LprErrorKind {
    IOError(IOError),
    TensorflowError(Status),
    ImageError(ImageError),
    ConfigError(ConfigError),
    GstreamerError(GstreamerError),
    FontError(String),
    InvalidInput(String),
}

/// Failures coming out of the gstreamer pipelines, flattened because
/// glib reports them with several unrelated types.
#[derive(Debug)]
pub enum GstreamerError {
    Glib(GlibError),
    Bool(BoolError),
    StateChange(StateChangeError),
    Pipeline(String),
}

impl LprError {

    pub fn kind(&self) -> &LprErrorKind {
        &self.0
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self(LprErrorKind::InvalidInput(msg.into()))
    }

    pub fn font(msg: impl Into<String>) -> Self {
        Self(LprErrorKind::FontError(msg.into()))
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self(LprErrorKind::GstreamerError(GstreamerError::Pipeline(msg.into())))
    }
}

impl<T> From<T> for LprError
where T:  Into<LprErrorKind>
{
    fn from(e: T) -> Self {
        Self(e.into())
    }
}

impl fmt::Display for LprError {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            LprErrorKind::IOError(e) => e.fmt(f),
            LprErrorKind::TensorflowError(e) => e.fmt(f),
            LprErrorKind::ImageError(e) => e.fmt(f),
            LprErrorKind::ConfigError(e) => write!(f, "invalid config: {}", e),
            LprErrorKind::GstreamerError(e) => e.fmt(f),
            LprErrorKind::FontError(msg) => write!(f, "font error: {}", msg),
            LprErrorKind::InvalidInput(msg) => f.write_str(msg),
        }
    }
}

impl fmt::Display for GstreamerError {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GstreamerError::Glib(e) => e.fmt(f),
            GstreamerError::Bool(e) => e.fmt(f),
            GstreamerError::StateChange(e) => e.fmt(f),
            GstreamerError::Pipeline(msg) => write!(f, "gstreamer pipeline: {}", msg),
        }
    }
}

impl Error for LprError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self.kind() {
            LprErrorKind::IOError(e) => Some(e),
            LprErrorKind::TensorflowError(e) => Some(e),
            LprErrorKind::ImageError(e) => Some(e),
            LprErrorKind::ConfigError(e) => Some(e),
            LprErrorKind::GstreamerError(GstreamerError::Glib(e)) => Some(e),
            LprErrorKind::GstreamerError(GstreamerError::Bool(e)) => Some(e),
            LprErrorKind::GstreamerError(GstreamerError::StateChange(e)) => Some(e),
            LprErrorKind::GstreamerError(GstreamerError::Pipeline(_)) => None,
            LprErrorKind::FontError(_) | LprErrorKind::InvalidInput(_) => None,
        }
    }
}

impl From<IOError> for LprErrorKind {
    fn from(e: IOError) -> Self {
        Self::IOError(e)
    }
}

impl From<Status> for LprErrorKind {
    fn from(e: Status) -> Self {
        Self::TensorflowError(e)
    }
}

impl From<ImageError> for LprErrorKind {
    fn from(e: ImageError) -> Self {
        Self::ImageError(e)
    }
}

impl From<ConfigError> for LprErrorKind {
    fn from(e: ConfigError) -> Self {
        Self::ConfigError(e)
    }
}

impl From<GlibError> for LprErrorKind {
    fn from(e: GlibError) -> Self {
        Self::GstreamerError(GstreamerError::Glib(e))
    }
}

impl From<BoolError> for LprErrorKind {
    fn from(e: BoolError) -> Self {
        Self::GstreamerError(GstreamerError::Bool(e))
    }
}

impl From<StateChangeError> for LprErrorKind {
    fn from(e: StateChangeError) -> Self {
        Self::GstreamerError(GstreamerError::StateChange(e))
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn io_errors_keep_their_source() {
        let err: LprError = IOError::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err.kind(), LprErrorKind::IOError(_)));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "gone");
    }

    #[test]
    fn invalid_input_displays_message() {
        let err = LprError::invalid_input("cannot read image");
        assert_eq!(err.to_string(), "cannot read image");
        assert!(err.source().is_none());
    }
}
