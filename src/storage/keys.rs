//! Object key layout: `<prefix>/user_<id>/<stem>_<suffix><ext>`

use crate::types::UserId;
use rand::Rng;

/// Length of the random suffix appended to the filename stem.
pub const SUFFIX_LEN: usize = 8;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Split a filename into stem and extension (with its dot).
///
/// The extension is everything from the last `.`; a leading dot alone does
/// not start an extension, so `.env` has no extension.
pub fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    }
}

/// Directory holding every object of `user`: `<prefix>/user_<id>/`.
pub fn user_prefix(prefix: &str, user: UserId) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("user_{}/", user)
    } else {
        format!("{}/user_{}/", prefix, user)
    }
}

fn random_suffix<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Fresh key for a new upload of `filename` by `user`.
pub fn object_key(prefix: &str, user: UserId, filename: &str) -> String {
    object_key_with(&mut rand::thread_rng(), prefix, user, filename)
}

pub fn object_key_with<R: Rng + ?Sized>(
    rng: &mut R,
    prefix: &str,
    user: UserId,
    filename: &str,
) -> String {
    let (stem, ext) = split_extension(filename);
    format!(
        "{}{}_{}{}",
        user_prefix(prefix, user),
        stem,
        random_suffix(rng),
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_key_layout() {
        let key = object_key("upload", UserId(7), "receipt.png");
        assert!(key.starts_with("upload/user_7/receipt_"));
        assert!(key.ends_with(".png"));
        assert_eq!(key.len(), "upload/user_7/receipt_".len() + SUFFIX_LEN + ".png".len());
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("receipt.png"), ("receipt", ".png"));
        assert_eq!(split_extension("scan.2024.jpeg"), ("scan.2024", ".jpeg"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".env"), (".env", ""));
    }

    #[test]
    fn test_user_prefix_trims_slashes() {
        assert_eq!(user_prefix("/upload/", UserId(3)), "upload/user_3/");
        assert_eq!(user_prefix("", UserId(3)), "user_3/");
    }

    #[test]
    fn test_repeated_uploads_get_distinct_keys() {
        let mut rng = StdRng::seed_from_u64(42);
        let keys: std::collections::HashSet<String> = (0..1000)
            .map(|_| object_key_with(&mut rng, "upload", UserId(1), "receipt.png"))
            .collect();
        assert_eq!(keys.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_key_shape(user in any::<u64>(), stem in "[A-Za-z0-9 _-]{1,40}", ext in "(\\.[a-z]{1,5})?") {
            let filename = format!("{}{}", stem, ext);
            let key = object_key("upload", UserId(user), &filename);

            let expected_prefix = format!("upload/user_{}/{}_", user, stem);
            prop_assert!(key.starts_with(&expected_prefix));
            prop_assert!(key.ends_with(&ext));

            let suffix = &key[expected_prefix.len()..key.len() - ext.len()];
            prop_assert_eq!(suffix.len(), SUFFIX_LEN);
            prop_assert!(suffix.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }
}
