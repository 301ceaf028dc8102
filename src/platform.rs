use regex::Regex;
use url::Url;

/// Media platforms the bot accepts URLs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Twitter,
    Facebook,
    Reddit,
    Vimeo,
    Pinterest,
    Dailymotion,
    SoundCloud,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::TikTok => "TikTok",
            Platform::Instagram => "Instagram",
            Platform::Twitter => "Twitter/X",
            Platform::Facebook => "Facebook",
            Platform::Reddit => "Reddit",
            Platform::Vimeo => "Vimeo",
            Platform::Pinterest => "Pinterest",
            Platform::Dailymotion => "Dailymotion",
            Platform::SoundCloud => "SoundCloud",
        }
    }
}

/// Ordered domain-substring table. First match wins; the domains do not
/// overlap in practice, so order carries no observable ambiguity.
const PLATFORM_DOMAINS: &[(Platform, &[&str])] = &[
    (Platform::YouTube, &["youtube.com", "youtu.be"]),
    (Platform::TikTok, &["tiktok.com"]),
    (Platform::Instagram, &["instagram.com"]),
    (Platform::Twitter, &["twitter.com", "x.com"]),
    (Platform::Facebook, &["facebook.com", "fb.watch"]),
    (Platform::Reddit, &["reddit.com"]),
    (Platform::Vimeo, &["vimeo.com"]),
    (Platform::Pinterest, &["pinterest.com", "pin.it"]),
    (Platform::Dailymotion, &["dailymotion.com"]),
    (Platform::SoundCloud, &["soundcloud.com"]),
];

/// Map a URL to a known platform, or `None` for unrecognized hosts.
pub fn classify(url: &str) -> Option<Platform> {
    let lowered = url.to_ascii_lowercase();
    for (platform, domains) in PLATFORM_DOMAINS {
        if domains.iter().any(|d| lowered.contains(d)) {
            return Some(*platform);
        }
    }
    None
}

/// Syntactic http(s) URL check AND a recognized platform.
pub fn validate(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    classify(url).is_some()
}

/// Pull the first http(s) URL out of arbitrary chat text.
///
/// Finds a `http://`/`https://` run, trims the trailing punctuation that
/// pasted prose tends to attach, and validates the remainder parses as a URL.
pub fn extract_first_url(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    // Forgiving matcher; `url::Url` does the real validation afterwards.
    let re = Regex::new(r"https?://[^\s]+").ok()?;

    for m in re.find_iter(text) {
        let cleaned = trim_trailing_punct(m.as_str());
        if cleaned.is_empty() {
            continue;
        }
        if Url::parse(cleaned).is_ok() {
            return Some(cleaned.to_string());
        }
    }
    None
}

/// Trim common trailing punctuation which frequently appears in pasted text.
///
/// Example: `https://example.com/foo),` -> `https://example.com/foo`
fn trim_trailing_punct(s: &str) -> &str {
    let mut end = s.len();
    while end > 0 {
        let ch = s[..end].chars().last().unwrap();
        let should_trim = matches!(
            ch,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\''
        );
        if !should_trim {
            break;
        }
        end -= ch.len_utf8();
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_platforms() {
        assert_eq!(classify("https://youtu.be/abc123"), Some(Platform::YouTube));
        assert_eq!(
            classify("https://www.youtube.com/watch?v=abc"),
            Some(Platform::YouTube)
        );
        assert_eq!(
            classify("https://www.tiktok.com/@u/video/1"),
            Some(Platform::TikTok)
        );
        assert_eq!(
            classify("https://www.instagram.com/reel/xyz/"),
            Some(Platform::Instagram)
        );
        assert_eq!(classify("https://x.com/u/status/1"), Some(Platform::Twitter));
        assert_eq!(classify("https://fb.watch/abc/"), Some(Platform::Facebook));
        assert_eq!(
            classify("https://www.reddit.com/r/videos/comments/1/"),
            Some(Platform::Reddit)
        );
        assert_eq!(classify("https://vimeo.com/12345"), Some(Platform::Vimeo));
        assert_eq!(classify("https://pin.it/abc"), Some(Platform::Pinterest));
        assert_eq!(
            classify("https://www.dailymotion.com/video/x1"),
            Some(Platform::Dailymotion)
        );
        assert_eq!(
            classify("https://soundcloud.com/artist/track"),
            Some(Platform::SoundCloud)
        );
    }

    #[test]
    fn unrecognized_domain_is_rejected() {
        assert_eq!(classify("https://example.com/video"), None);
        assert!(!validate("https://example.com/video"));
    }

    #[test]
    fn validate_requires_http_scheme() {
        assert!(validate("https://youtu.be/abc123"));
        assert!(!validate("ftp://youtube.com/x"));
        assert!(!validate("youtu.be/abc123"));
        assert!(!validate("not a url"));
    }

    #[test]
    fn extracts_url_from_prose() {
        assert_eq!(
            extract_first_url("check this out https://youtu.be/abc123 please"),
            Some("https://youtu.be/abc123".to_string())
        );
        assert_eq!(extract_first_url("no links here"), None);
        assert_eq!(extract_first_url(""), None);
    }

    #[test]
    fn trims_trailing_punct() {
        assert_eq!(
            extract_first_url("see (https://vimeo.com/123), ok"),
            Some("https://vimeo.com/123".to_string())
        );
    }

    #[test]
    fn ignores_non_http_schemes() {
        assert_eq!(
            extract_first_url("ftp://example.com/x https://vimeo.com/9"),
            Some("https://vimeo.com/9".to_string())
        );
    }
}
