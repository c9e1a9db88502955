use chrono::prelude::*;
use easy_ext::ext;

#[ext(DateTimeExt)]
pub(crate) impl<Tz: chrono::TimeZone> DateTime<Tz>
where
    Tz::Offset: std::fmt::Display,
{
    /// Format used in the sheets `written_at` column and in `/status`
    fn to_human_readable(&self) -> String {
        self.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn to_human_readable_with_offset(&self) -> String {
        self.format("%Y-%m-%d %H:%M:%S (GMT%:z)").to_string()
    }
}
