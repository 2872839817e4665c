//! UID padding.
//!
//! UIDs read from the wire or given by the user may carry
//! a trailing null byte (even length padding of the UI value representation),
//! or trailing spaces left by lenient encoders.
//! Comparisons and lookups are made on the trimmed value.

use std::borrow::Cow;

/// The UID without its trailing padding.
pub(crate) fn trim_uid_str(uid: &str) -> &str {
    uid.trim_end_matches(|c| c == '\0' || c == ' ')
}

/// Trim the padding of a UID, without copying it.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    match uid {
        Cow::Borrowed(uid) => Cow::Borrowed(trim_uid_str(uid)),
        Cow::Owned(mut uid) => {
            let len = trim_uid_str(&uid).len();
            uid.truncate(len);
            Cow::Owned(uid)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::{trim_uid, trim_uid_str};

    #[test]
    fn padding_is_removed() {
        assert_eq!(trim_uid_str("1.2.3.4"), "1.2.3.4");
        assert_eq!(trim_uid_str("1.2.3.45\0"), "1.2.3.45");
        assert_eq!(trim_uid_str("1.2.3.45 "), "1.2.3.45");
        assert_eq!(trim_uid_str("\0"), "");
    }

    #[test]
    fn borrowed_uids_stay_borrowed() {
        let uid = trim_uid(Cow::Borrowed("1.2.840.10008.1.1\0"));
        assert!(matches!(uid, Cow::Borrowed("1.2.840.10008.1.1")));
        let uid = trim_uid(Cow::Owned("1.2.840.10008.1.2\0".to_string()));
        assert_eq!(uid, "1.2.840.10008.1.2");
    }
}
