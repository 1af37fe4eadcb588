//! Content filters: author allow/mute lists, keyword gates, and
//! attachment-type ignores.

use {
    courier_common::types::{Attachment, MessageAuthor},
    courier_config::FilterConfig,
};

/// Check if a peer matches an allow/mute list entry.
///
/// Entries are matched case-insensitively against the author id, handle,
/// and display name. Supports exact match and glob-style `*` wildcards.
pub fn matches_list(author: &MessageAuthor, list: &[String]) -> bool {
    let candidates = [
        author.id.to_lowercase(),
        author.name.to_lowercase(),
        author.display().to_lowercase(),
    ];
    list.iter().any(|pattern| {
        let pat = pattern.to_lowercase();
        candidates.iter().any(|c| {
            if pat.contains('*') {
                glob_match(&pat, c)
            } else {
                &pat == c
            }
        })
    })
}

/// Author gate: a configured allowlist admits only its members; the
/// mutelist always wins.
pub fn author_passes(author: &MessageAuthor, filters: &FilterConfig) -> bool {
    if !filters.user_allowlist.is_empty() && !matches_list(author, &filters.user_allowlist) {
        return false;
    }
    !matches_list(author, &filters.user_mutelist)
}

/// Required-keyword gate over all textual surfaces: with a non-empty list,
/// at least one keyword must appear (case-insensitive substring).
pub fn required_keywords_pass(surfaces: &[&str], required: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }
    let lowered: Vec<String> = surfaces.iter().map(|s| s.to_lowercase()).collect();
    required
        .iter()
        .any(|kw| lowered.iter().any(|s| s.contains(&kw.to_lowercase())))
}

/// Exclude-keyword gate: any match drops the message.
pub fn excluded_keywords_pass(surfaces: &[&str], excluded: &[String]) -> bool {
    if excluded.is_empty() {
        return true;
    }
    let lowered: Vec<String> = surfaces.iter().map(|s| s.to_lowercase()).collect();
    !excluded
        .iter()
        .any(|kw| lowered.iter().any(|s| s.contains(&kw.to_lowercase())))
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "wav", "flac", "m4a", "opus"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "csv", "zip", "rar", "7z",
];

/// True when an enabled ignore flag matches the attachment's content-type
/// or filename extension.
pub fn attachment_ignored(attachment: &Attachment, filters: &FilterConfig) -> bool {
    let kind_matches = |prefix: &str, extensions: &[&str]| {
        if let Some(ct) = &attachment.content_type
            && ct.starts_with(prefix)
        {
            return true;
        }
        attachment
            .extension()
            .is_some_and(|ext| extensions.contains(&ext.as_str()))
    };

    (filters.ignore_images && kind_matches("image/", IMAGE_EXTENSIONS))
        || (filters.ignore_audio && kind_matches("audio/", AUDIO_EXTENSIONS))
        || (filters.ignore_video && kind_matches("video/", VIDEO_EXTENSIONS))
        || (filters.ignore_documents
            && (kind_matches("application/", DOCUMENT_EXTENSIONS)
                || kind_matches("text/", DOCUMENT_EXTENSIONS)))
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if !parts.last().unwrap_or(&"").is_empty() {
        pos == text.len()
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(name: &str) -> MessageAuthor {
        MessageAuthor {
            id: "1001".into(),
            name: name.into(),
            display_name: None,
            avatar_url: None,
            is_bot: false,
        }
    }

    #[test]
    fn allowlist_admits_members_only() {
        let filters = FilterConfig {
            user_allowlist: vec!["alice".into()],
            ..Default::default()
        };
        assert!(author_passes(&author("Alice"), &filters));
        assert!(!author_passes(&author("bob"), &filters));
    }

    #[test]
    fn mutelist_wins_over_allowlist() {
        let filters = FilterConfig {
            user_allowlist: vec!["alice".into()],
            user_mutelist: vec!["alice".into()],
            ..Default::default()
        };
        assert!(!author_passes(&author("alice"), &filters));
    }

    #[test]
    fn empty_lists_admit_everyone() {
        assert!(author_passes(&author("anyone"), &FilterConfig::default()));
    }

    #[test]
    fn list_matches_author_id_and_glob() {
        let a = author("alice");
        assert!(matches_list(&a, &["1001".into()]));
        assert!(matches_list(&a, &["ali*".into()]));
        assert!(!matches_list(&a, &["bob*".into()]));
    }

    #[test]
    fn required_keywords_need_one_match() {
        let required = vec!["a".to_string(), "b".to_string()];
        assert!(!required_keywords_pass(&["xyz"], &required));
        assert!(required_keywords_pass(&["xa"], &required));
        assert!(required_keywords_pass(&["xyz", "B side"], &required));
        assert!(required_keywords_pass(&["anything"], &[]));
    }

    #[test]
    fn excluded_keyword_drops() {
        let excluded = vec!["spoiler".to_string()];
        assert!(excluded_keywords_pass(&["all clear"], &excluded));
        assert!(!excluded_keywords_pass(&["big SPOILER ahead"], &excluded));
    }

    #[test]
    fn keywords_scan_embed_surfaces() {
        let required = vec!["signal".to_string()];
        // Body misses, embed field hits.
        assert!(required_keywords_pass(&["body", "Signal in a field"], &required));
    }

    #[test]
    fn attachment_ignores_by_content_type_and_extension() {
        let filters = FilterConfig {
            ignore_images: true,
            ignore_documents: true,
            ..Default::default()
        };

        let by_type = Attachment {
            filename: "pic".into(),
            url: String::new(),
            content_type: Some("image/png".into()),
            size: 1,
        };
        let by_ext = Attachment {
            filename: "notes.PDF".into(),
            url: String::new(),
            content_type: None,
            size: 1,
        };
        let video = Attachment {
            filename: "clip.mp4".into(),
            url: String::new(),
            content_type: Some("video/mp4".into()),
            size: 1,
        };

        assert!(attachment_ignored(&by_type, &filters));
        assert!(attachment_ignored(&by_ext, &filters));
        // Video ignores not enabled.
        assert!(!attachment_ignored(&video, &filters));
    }
}
