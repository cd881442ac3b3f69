use crate::error::{Error, ErrorKind};
use crate::models::{to_datetime, to_u64};
use exn::ResultExt;
use tome_pages::Pages;

#[derive(sqlx::FromRow)]
pub(crate) struct PagesRow {
    pages: i64,
    algorithm: i64,
    format: String,
    format_size: i64,
    scanned_at: i64,
}
impl TryFrom<PagesRow> for Pages {
    type Error = Error;
    fn try_from(row: PagesRow) -> Result<Self, Self::Error> {
        Ok(Self {
            pages: row.pages,
            algorithm: u32::try_from(row.algorithm).or_raise(|| ErrorKind::InvalidData("page count algorithm"))?,
            format: row.format,
            format_size: to_u64(row.format_size, "format size")?,
            scanned_at: to_datetime(row.scanned_at, "page scan date")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tome_pages::DRM_LOCKED;

    #[test]
    fn test_sentinel_survives_conversion() {
        let row = PagesRow { pages: DRM_LOCKED, algorithm: 1, format: String::new(), format_size: 0, scanned_at: 0 };
        let pages = Pages::try_from(row).unwrap();
        assert!(pages.is_failure());
        assert_eq!(pages.pages, DRM_LOCKED);
    }

    #[test]
    fn test_invalid_algorithm() {
        let row = PagesRow { pages: 10, algorithm: -4, format: "EPUB".into(), format_size: 5, scanned_at: 0 };
        let err = Pages::try_from(row).unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidData("page count algorithm")));
    }
}
