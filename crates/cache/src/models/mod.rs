mod book;
mod format;
mod pages;
mod search;

pub use self::book::Book;
pub(crate) use self::book::BookRow;
pub use self::format::Format;
pub(crate) use self::format::FormatRow;
pub(crate) use self::pages::PagesRow;
pub use self::search::SearchHit;
pub(crate) use self::search::SearchRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::UtcDateTime;

pub(crate) fn to_i64(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn to_u64(value: i64, what: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn to_datetime(timestamp: i64, what: &'static str) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp(timestamp).or_raise(|| ErrorKind::InvalidData(what))
}
