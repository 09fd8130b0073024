/// A failure to decode a value from call frame information.
///
/// These never leave the crate on their own: the stage that hits one turns it
/// into a [`Problem`](super::Problem) for the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("invalid pointer encoding {0:#04x}")]
    InvalidEncoding(u8),
    #[error("no base address for pointer encoding {0:#04x}")]
    UnusableEncoding(u8),
    #[error("unrecognized instruction {0:#04x}")]
    BadInstruction(u8),
    #[error("unrecognized augmentation letter {:?}", char::from(*.0))]
    BadAugmentation(u8),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
