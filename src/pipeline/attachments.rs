//! Attachment acquisition
//!
//! Decides what to do with a scraped attachment (copy a local file, download
//! a URL, keep a link or record a missing file) and carries it out through an
//! [`AttachmentFetcher`].

use crate::core::config::PrefsConfig;
use crate::core::error::{Result, TranslateError};
use crate::library::models::{ItemId, LinkMode, NewAttachment};
use crate::pipeline::records::ScrapedAttachment;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Downloaded attachment content
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Network access used to download attachment content
pub trait AttachmentFetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> Result<FetchedContent>;
}

/// Fetcher backed by a blocking reqwest client
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TranslateError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl AttachmentFetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<FetchedContent> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| TranslateError::Network(format!("{}: {}", url, e)))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response
            .bytes()
            .map_err(|e| TranslateError::Network(format!("{}: {}", url, e)))?;
        Ok(FetchedContent {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Where an attachment's content lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Url(Url),
    Path(PathBuf),
}

/// What the saver will do with one attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentAction {
    ImportFile(PathBuf),
    MissingFile(PathBuf),
    ImportUrl(Url),
    LinkUrl(Url),
    Skip(&'static str),
}

/// Sniff whether an attachment points at a URL or a local path.
///
/// `file:` URLs and strings that do not parse as URLs are paths; relative
/// paths are resolved against `base_dir` (the directory of the import file).
pub fn resolve_source(attachment: &ScrapedAttachment, base_dir: Option<&Path>) -> Option<AttachmentSource> {
    let relative = |path: PathBuf| match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    };

    if let Some(path) = attachment.path.as_deref().filter(|p| !p.is_empty()) {
        if let Ok(url) = Url::parse(path) {
            if url.scheme() == "file" {
                return url.to_file_path().ok().map(AttachmentSource::Path);
            }
        }
        return Some(AttachmentSource::Path(relative(PathBuf::from(path))));
    }

    let raw = attachment.url.as_deref().filter(|u| !u.is_empty())?;
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok().map(AttachmentSource::Path),
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(AttachmentSource::Url(url)),
        // Windows drive letters parse as a one-letter scheme
        Ok(url) if url.scheme().len() == 1 => Some(AttachmentSource::Path(PathBuf::from(raw))),
        Ok(url) => Some(AttachmentSource::Url(url)),
        Err(_) => Some(AttachmentSource::Path(relative(PathBuf::from(raw)))),
    }
}

fn file_action(path: PathBuf) -> AttachmentAction {
    if path.is_file() {
        AttachmentAction::ImportFile(path)
    } else {
        AttachmentAction::MissingFile(path)
    }
}

/// Plan a standalone attachment record (import only)
pub fn plan_standalone(attachment: &ScrapedAttachment, base_dir: Option<&Path>) -> AttachmentAction {
    match resolve_source(attachment, base_dir) {
        Some(AttachmentSource::Path(path)) => file_action(path),
        Some(AttachmentSource::Url(url)) if attachment.snapshot == Some(false) => AttachmentAction::LinkUrl(url),
        Some(AttachmentSource::Url(url)) => AttachmentAction::ImportUrl(url),
        None => AttachmentAction::Skip("no url or path"),
    }
}

/// Plan an attachment nested under an item, applying the user's preferences
pub fn plan_nested(
    attachment: &ScrapedAttachment,
    importing: bool,
    prefs: &PrefsConfig,
    base_dir: Option<&Path>,
) -> AttachmentAction {
    if !prefs.save_attachments {
        return AttachmentAction::Skip("attachment saving disabled");
    }
    if !importing && !prefs.automatic_snapshots && !prefs.download_associated_files {
        return AttachmentAction::Skip("snapshots and file downloads disabled");
    }

    match resolve_source(attachment, base_dir) {
        None => AttachmentAction::Skip("no url or path"),
        Some(AttachmentSource::Path(path)) if importing => file_action(path),
        Some(AttachmentSource::Path(_)) => AttachmentAction::Skip("local paths are only accepted on import"),
        Some(AttachmentSource::Url(url)) => {
            if attachment.snapshot == Some(false) {
                return AttachmentAction::LinkUrl(url);
            }
            if importing {
                return AttachmentAction::ImportUrl(url);
            }
            let wanted = if is_html(attachment, &url) {
                prefs.automatic_snapshots
            } else {
                prefs.download_associated_files
            };
            if wanted {
                AttachmentAction::ImportUrl(url)
            } else {
                AttachmentAction::LinkUrl(url)
            }
        }
    }
}

/// Snapshots are HTML; without a declared type, guess from the URL path
fn is_html(attachment: &ScrapedAttachment, url: &Url) -> bool {
    match attachment.mime_type.as_deref() {
        Some(mime) => mime.eq_ignore_ascii_case("text/html") || mime.eq_ignore_ascii_case("application/xhtml+xml"),
        None => match mime_guess::from_path(url.path()).first_raw() {
            Some(guess) => guess == "text/html",
            None => true,
        },
    }
}

fn default_title(attachment: &ScrapedAttachment, fallback: &str) -> String {
    attachment
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn guessed_type(attachment: &ScrapedAttachment, path: &str) -> Option<String> {
    attachment
        .mime_type
        .clone()
        .or_else(|| mime_guess::from_path(path).first_raw().map(str::to_string))
}

/// Carry out a planned action. Returns `None` for skipped attachments.
///
/// A failed download degrades to a linked URL.
pub fn acquire(
    action: AttachmentAction,
    attachment: &ScrapedAttachment,
    parent: Option<ItemId>,
    fetcher: &dyn AttachmentFetcher,
) -> Option<NewAttachment> {
    match action {
        AttachmentAction::Skip(reason) => {
            debug!(reason, url = ?attachment.url, path = ?attachment.path, "Skipping attachment");
            None
        }
        AttachmentAction::ImportFile(path) | AttachmentAction::MissingFile(path) => {
            let missing = !path.is_file();
            if missing {
                warn!(path = %path.display(), "Attachment file does not exist");
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Attachment".to_string());
            Some(NewAttachment {
                parent,
                link_mode: if missing { LinkMode::MissingFile } else { LinkMode::ImportedFile },
                title: default_title(attachment, &name),
                url: None,
                content_type: guessed_type(attachment, &path.to_string_lossy()),
                path: Some(path),
                content: None,
            })
        }
        AttachmentAction::LinkUrl(url) => Some(link(attachment, url, parent)),
        AttachmentAction::ImportUrl(url) => match fetcher.fetch(&url) {
            Ok(fetched) => Some(NewAttachment {
                parent,
                link_mode: LinkMode::ImportedUrl,
                title: default_title(attachment, url.as_str()),
                content_type: attachment.mime_type.clone().or(fetched.content_type),
                url: Some(url.to_string()),
                path: None,
                content: Some(fetched.bytes),
            }),
            Err(e) => {
                warn!(url = %url, error = %e, "Attachment download failed, saving a link instead");
                Some(link(attachment, url, parent))
            }
        },
    }
}

fn link(attachment: &ScrapedAttachment, url: Url, parent: Option<ItemId>) -> NewAttachment {
    NewAttachment {
        parent,
        link_mode: LinkMode::LinkedUrl,
        title: default_title(attachment, url.as_str()),
        content_type: attachment.mime_type.clone(),
        url: Some(url.to_string()),
        path: None,
        content: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fetcher that serves fixed bytes or fails every request
    pub(crate) struct StaticFetcher {
        pub fail: bool,
        pub requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub(crate) fn ok() -> Self {
            Self { fail: false, requests: Mutex::new(Vec::new()) }
        }

        pub(crate) fn failing() -> Self {
            Self { fail: true, requests: Mutex::new(Vec::new()) }
        }
    }

    impl AttachmentFetcher for StaticFetcher {
        fn fetch(&self, url: &Url) -> Result<FetchedContent> {
            self.requests.lock().unwrap().push(url.to_string());
            if self.fail {
                return Err(TranslateError::Network("connection refused".into()));
            }
            Ok(FetchedContent { bytes: b"<html></html>".to_vec(), content_type: Some("text/html".into()) })
        }
    }

    fn url_attachment(url: &str) -> ScrapedAttachment {
        ScrapedAttachment { url: Some(url.into()), ..Default::default() }
    }

    #[test]
    fn test_resolve_file_url_and_relative_path() {
        let base = Path::new("/data/import");
        let file_url = url_attachment("file:///tmp/paper.pdf");
        assert_eq!(resolve_source(&file_url, Some(base)), Some(AttachmentSource::Path("/tmp/paper.pdf".into())));

        let relative = ScrapedAttachment { path: Some("files/paper.pdf".into()), ..Default::default() };
        assert_eq!(
            resolve_source(&relative, Some(base)),
            Some(AttachmentSource::Path("/data/import/files/paper.pdf".into()))
        );

        let web = url_attachment("https://example.org/a.pdf");
        assert!(matches!(resolve_source(&web, None), Some(AttachmentSource::Url(_))));
    }

    #[test]
    fn test_standalone_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.pdf");
        std::fs::write(&present, b"%PDF").unwrap();

        let found = ScrapedAttachment { path: Some("here.pdf".into()), ..Default::default() };
        assert_eq!(plan_standalone(&found, Some(dir.path())), AttachmentAction::ImportFile(present));

        let gone = ScrapedAttachment { path: Some("gone.pdf".into()), ..Default::default() };
        assert!(matches!(plan_standalone(&gone, Some(dir.path())), AttachmentAction::MissingFile(_)));
    }

    #[test]
    fn test_nested_policy() {
        let prefs = PrefsConfig::default();
        let page = url_attachment("https://example.org/article");
        assert!(matches!(plan_nested(&page, false, &prefs, None), AttachmentAction::ImportUrl(_)));

        let link_only = ScrapedAttachment { snapshot: Some(false), ..url_attachment("https://example.org/") };
        assert!(matches!(plan_nested(&link_only, false, &prefs, None), AttachmentAction::LinkUrl(_)));

        let no_snapshots = PrefsConfig { automatic_snapshots: false, ..PrefsConfig::default() };
        assert!(matches!(plan_nested(&page, false, &no_snapshots, None), AttachmentAction::LinkUrl(_)));
        let pdf = url_attachment("https://example.org/paper.pdf");
        assert!(matches!(plan_nested(&pdf, false, &no_snapshots, None), AttachmentAction::ImportUrl(_)));

        let nothing = PrefsConfig { automatic_snapshots: false, download_associated_files: false, ..PrefsConfig::default() };
        assert!(matches!(plan_nested(&page, false, &nothing, None), AttachmentAction::Skip(_)));
        assert!(matches!(plan_nested(&page, true, &nothing, None), AttachmentAction::ImportUrl(_)));

        let disabled = PrefsConfig { save_attachments: false, ..PrefsConfig::default() };
        assert!(matches!(plan_nested(&page, true, &disabled, None), AttachmentAction::Skip(_)));
    }

    #[test]
    fn test_failed_download_degrades_to_link() {
        let page = url_attachment("https://example.org/article");
        let action = AttachmentAction::ImportUrl(Url::parse("https://example.org/article").unwrap());
        let saved = acquire(action, &page, Some(1), &StaticFetcher::failing()).unwrap();
        assert_eq!(saved.link_mode, LinkMode::LinkedUrl);
        assert_eq!(saved.parent, Some(1));
    }

    #[test]
    fn test_download_keeps_content() {
        let page = url_attachment("https://example.org/article");
        let action = AttachmentAction::ImportUrl(Url::parse("https://example.org/article").unwrap());
        let saved = acquire(action, &page, None, &StaticFetcher::ok()).unwrap();
        assert_eq!(saved.link_mode, LinkMode::ImportedUrl);
        assert_eq!(saved.content_type.as_deref(), Some("text/html"));
        assert!(saved.content.is_some());
    }
}
