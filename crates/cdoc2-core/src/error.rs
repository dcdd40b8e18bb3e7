use thiserror::Error;

pub type Cdoc2Result<T> = Result<T, Cdoc2Error>;

/// Failure taxonomy shared by every cdoc2 crate.
///
/// `Parse` means the document is malformed (or not addressed to the caller),
/// `Integrity` means it is well-formed but was tampered with or opened with
/// the wrong key material.
#[derive(Debug, Error)]
pub enum Cdoc2Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl Cdoc2Error {
    pub fn is_parse(&self) -> bool {
        matches!(self, Cdoc2Error::Parse(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Cdoc2Error::Integrity(_))
    }

    pub fn is_crypto(&self) -> bool {
        matches!(self, Cdoc2Error::Crypto(_))
    }

    /// Carry this error through a `Read`/`Write` boundary.
    ///
    /// The inverse is the `From<std::io::Error>` impl, which recovers the
    /// original variant instead of flattening it into `Io`.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Cdoc2Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<std::io::Error> for Cdoc2Error {
    fn from(err: std::io::Error) -> Self {
        let carries_cdoc2 = err
            .get_ref()
            .is_some_and(|inner| inner.is::<Cdoc2Error>());
        if !carries_cdoc2 {
            return Cdoc2Error::Io(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Cdoc2Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Cdoc2Error::Io(std::io::Error::new(kind, other)),
            None => Cdoc2Error::Io(std::io::Error::from(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_io_error_stays_io() {
        let err: Cdoc2Error =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read").into();
        assert!(matches!(err, Cdoc2Error::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_embedded_error_survives_io_roundtrip() {
        let io = Cdoc2Error::Integrity("payload: tag mismatch".into()).into_io();
        let back: Cdoc2Error = io.into();
        assert!(back.is_integrity());
        assert_eq!(back.to_string(), "integrity error: payload: tag mismatch");
    }

    #[test]
    fn test_io_variant_unwraps_on_into_io() {
        let io = Cdoc2Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
