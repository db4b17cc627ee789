use crate::error::EpubError;
use crate::models::Chapter;
use crate::utils::decode_utf8;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::LazyLock;
use url::Url;
use zip::ZipArchive;

const CONTAINER_PATH: &str = "META-INF/container.xml";
const XHTML_MEDIA_TYPE: &str = "application/xhtml+xml";
/// Base URL standing in for the archive root when resolving hrefs.
const ARCHIVE_ROOT: &str = "epub:/";

static ROOTFILE: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<rootfile\b[^>]*>"));
static ITEM: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<(?:\w+:)?item\b[^>]*>"));
static ITEMREF: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<(?:\w+:)?itemref\b[^>]*>"));
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| re(r#"([\w:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#));
static INVISIBLE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?is)<head\b.*?</head\s*>|<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
});
static HEADING: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<h([1-3])\b[^>]*>(.*?)</h[1-3]\s*>"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| re(r"(?is)<title\b[^>]*>(.*?)</title\s*>"));
static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)<br\s*/?>|</?(?:p|div|h[1-6]|li|tr|blockquote|section|article|pre|dd|dt)\b[^>]*>")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)<[^>]*>"));
static INLINE_SPACE: LazyLock<Regex> = LazyLock::new(|| re(r"[ \t\u{a0}]+"));

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

/// Pulls reading-order chapter text out of an EPUB archive.
///
/// Spine documents shorter than `min_chars` characters are treated as front
/// or back matter (covers, title pages, copyright notices) and dropped.
#[derive(Debug, Clone)]
pub struct EpubExtractor {
    min_chars: usize,
}

struct ManifestItem {
    href: String,
    media_type: String,
    properties: String,
}

impl EpubExtractor {
    pub fn new(min_chars: usize) -> Self {
        EpubExtractor { min_chars }
    }

    pub fn extract_path(&self, path: &Path) -> Result<Vec<Chapter>, EpubError> {
        let file = File::open(path)?;
        self.extract(file)
    }

    pub fn extract<R: Read + Seek>(&self, reader: R) -> Result<Vec<Chapter>, EpubError> {
        let mut archive = ZipArchive::new(reader)?;

        let container = read_entry(&mut archive, CONTAINER_PATH)?;
        let opf_path = rootfile_path(&container)?;
        let opf = read_entry(&mut archive, &opf_path)?;

        let manifest = parse_manifest(&opf);
        let spine = parse_spine(&opf);
        if spine.is_empty() {
            return Err(EpubError::Malformed(format!("{} has an empty spine", opf_path)));
        }

        let mut chapters = Vec::new();
        for idref in spine {
            let Some(item) = manifest.get(&idref) else {
                tracing::warn!("Spine references unknown manifest item {}", idref);
                continue;
            };
            if item.media_type != XHTML_MEDIA_TYPE
                || item.properties.split_whitespace().any(|p| p == "nav")
            {
                continue;
            }

            let Some(source) = resolve_href(&opf_path, &item.href) else {
                tracing::warn!("Skipping content outside the archive: {}", item.href);
                continue;
            };
            let markup = match read_entry(&mut archive, &source) {
                Ok(markup) => markup,
                Err(EpubError::MissingEntry(path)) => {
                    tracing::warn!("Skipping missing content document {}", path);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let text = html_to_text(&markup);
            let length = text.chars().count();
            if length < self.min_chars {
                tracing::debug!("Skipping {} ({} chars, below {})", source, length, self.min_chars);
                continue;
            }

            chapters.push(Chapter {
                index: chapters.len() + 1,
                title: document_title(&markup),
                source,
                text,
            });
        }

        tracing::info!("Extracted {} chapters", chapters.len());
        Ok(chapters)
    }
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String, EpubError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(EpubError::MissingEntry(name.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(decode_utf8(&bytes))
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .map(|caps| {
            let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            (
                caps[1].to_string(),
                html_escape::decode_html_entities(value).into_owned(),
            )
        })
        .collect()
}

fn rootfile_path(container: &str) -> Result<String, EpubError> {
    ROOTFILE
        .find_iter(container)
        .map(|m| attributes(m.as_str()))
        .find_map(|attrs| attrs.get("full-path").cloned())
        .ok_or_else(|| EpubError::Malformed("container.xml has no rootfile".to_string()))
}

fn parse_manifest(opf: &str) -> HashMap<String, ManifestItem> {
    ITEM.find_iter(opf)
        .filter_map(|m| {
            let mut attrs = attributes(m.as_str());
            let id = attrs.remove("id")?;
            let href = attrs.remove("href")?;
            Some((
                id,
                ManifestItem {
                    href,
                    media_type: attrs.remove("media-type").unwrap_or_default(),
                    properties: attrs.remove("properties").unwrap_or_default(),
                },
            ))
        })
        .collect()
}

/// Spine `idref`s in reading order, without `linear="no"` entries.
fn parse_spine(opf: &str) -> Vec<String> {
    ITEMREF
        .find_iter(opf)
        .filter_map(|m| {
            let mut attrs = attributes(m.as_str());
            if attrs.get("linear").is_some_and(|l| l.trim() == "no") {
                return None;
            }
            attrs.remove("idref")
        })
        .collect()
}

/// Resolve a manifest href against the package document to an archive entry
/// name. Query and fragment are dropped. Hrefs pointing outside the archive
/// (`http:`, `mailto:` and the like) resolve to `None`.
fn resolve_href(opf_path: &str, href: &str) -> Option<String> {
    let package = Url::parse(ARCHIVE_ROOT).ok()?.join(opf_path).ok()?;
    let target = package.join(href.trim()).ok()?;
    if target.scheme() != package.scheme() {
        return None;
    }
    let path = target.path().trim_start_matches('/');
    let decoded = urlencoding::decode(path).ok()?;
    (!decoded.is_empty()).then(|| decoded.into_owned())
}

fn document_title(markup: &str) -> Option<String> {
    let raw = HEADING
        .captures(markup)
        .and_then(|caps| caps.get(2))
        .or_else(|| TITLE.captures(markup).and_then(|caps| caps.get(1)))?;
    let title = html_to_text(raw.as_str()).replace('\n', " ");
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Reduce XHTML markup to readable plain text, one paragraph per line.
pub fn html_to_text(markup: &str) -> String {
    let visible = INVISIBLE.replace_all(markup, " ");
    let broken = BLOCK_BREAK.replace_all(&visible, "\n");
    let stripped = TAG.replace_all(&broken, "");
    let decoded = html_escape::decode_html_entities(&stripped);

    decoded
        .lines()
        .map(|line| INLINE_SPACE.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn paragraph(seed: &str, repeat: usize) -> String {
        std::iter::repeat(seed).take(repeat).collect::<Vec<_>>().join(" ")
    }

    fn xhtml(heading: &str, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>{heading}</title>
<style>p {{ margin: 0 }}</style></head>
<body><h1>{heading}</h1><p>{body}</p></body></html>"#
        )
    }

    fn build_archive(entries: &[(&str, String)]) -> Cursor<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    fn sample_book() -> Cursor<Vec<u8>> {
        let opf = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="cover" href="Text/cover.xhtml" media-type="application/xhtml+xml"/>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c2" href="Text/chapter%202.xhtml" media-type="application/xhtml+xml"/>
    <item id="c1" href="Text/chapter1.xhtml#start" media-type="application/xhtml+xml"/>
    <item id="img" href="../Images/pic.png" media-type="image/png"/>
    <item id="notes" href="Text/notes.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine>
    <itemref idref="cover"/>
    <itemref idref="nav"/>
    <itemref idref="c1"/>
    <itemref idref="img"/>
    <itemref idref="c2"/>
    <itemref idref="notes" linear="no"/>
  </spine>
</package>"#;
        build_archive(&[
            (CONTAINER_PATH, CONTAINER.to_string()),
            ("OEBPS/content.opf", opf.to_string()),
            ("OEBPS/Text/cover.xhtml", xhtml("Cover", "A Novel")),
            ("OEBPS/nav.xhtml", xhtml("Contents", &paragraph("toc", 400))),
            (
                "OEBPS/Text/chapter1.xhtml",
                xhtml("The Storm", &paragraph("wind and rain", 100)),
            ),
            (
                "OEBPS/Text/chapter 2.xhtml",
                xhtml("The Harbor", &paragraph("ships &amp; sails", 100)),
            ),
            ("OEBPS/Text/notes.xhtml", xhtml("Notes", &paragraph("note", 400))),
        ])
    }

    #[test]
    fn test_extracts_spine_order_and_filters_front_matter() {
        let chapters = EpubExtractor::new(1000).extract(sample_book()).unwrap();
        assert_eq!(chapters.len(), 2);

        assert_eq!(chapters[0].index, 1);
        assert_eq!(chapters[0].title.as_deref(), Some("The Storm"));
        assert_eq!(chapters[0].source, "OEBPS/Text/chapter1.xhtml");
        assert!(chapters[0].text.starts_with("The Storm\nwind and rain"));

        assert_eq!(chapters[1].index, 2);
        assert_eq!(chapters[1].source, "OEBPS/Text/chapter 2.xhtml");
        assert!(chapters[1].text.contains("ships & sails"));
        assert!(!chapters[1].text.contains("margin"));
    }

    #[test]
    fn test_low_threshold_keeps_cover() {
        let chapters = EpubExtractor::new(1).extract(sample_book()).unwrap();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].text, "Cover\nA Novel");
    }

    #[test]
    fn test_missing_container_is_reported() {
        let archive = build_archive(&[("mimetype", "application/epub+zip".to_string())]);
        let err = EpubExtractor::new(1000).extract(archive).unwrap_err();
        assert!(matches!(err, EpubError::MissingEntry(ref p) if p == CONTAINER_PATH));
    }

    #[test]
    fn test_not_a_zip() {
        let err = EpubExtractor::new(1000)
            .extract(Cursor::new(b"plain text".to_vec()))
            .unwrap_err();
        assert!(matches!(err, EpubError::Zip(_)));
    }

    #[test]
    fn test_resolve_href() {
        let resolve = |opf: &str, href: &str| resolve_href(opf, href);
        assert_eq!(resolve("OEBPS/content.opf", "Text/a.xhtml").as_deref(), Some("OEBPS/Text/a.xhtml"));
        assert_eq!(resolve("OEBPS/content.opf", "../a.xhtml").as_deref(), Some("a.xhtml"));
        assert_eq!(resolve("content.opf", "./a%20b.xhtml#x").as_deref(), Some("a b.xhtml"));
        assert_eq!(resolve("a/b/content.opf", "../c/./d.xhtml").as_deref(), Some("a/c/d.xhtml"));
        assert_eq!(resolve("My Book/content.opf", "Text/é.xhtml").as_deref(), Some("My Book/Text/é.xhtml"));
    }

    #[test]
    fn test_resolve_href_drops_query_and_rejects_external() {
        assert_eq!(
            resolve_href("OEBPS/content.opf", "Text/a.xhtml?v=2").as_deref(),
            Some("OEBPS/Text/a.xhtml")
        );
        assert_eq!(resolve_href("OEBPS/content.opf", "http://example.com/x.xhtml"), None);
        assert_eq!(resolve_href("OEBPS/content.opf", "/Text/root.xhtml").as_deref(), Some("Text/root.xhtml"));
    }

    #[test]
    fn test_html_to_text() {
        let html = "<html><head><title>x</title></head><body>\
            <p>First&nbsp;line</p><p>Second <em>line</em></p><br/>\
            <script>var a = 1;</script><!-- hidden --><div>  Third   line </div></body></html>";
        assert_eq!(html_to_text(html), "First line\nSecond line\nThird line");
    }

    #[test]
    fn test_epub_builder_archive() {
        use epub_builder::{EpubBuilder, EpubContent, ZipLibrary};

        let mut builder = EpubBuilder::new(ZipLibrary::new().unwrap()).unwrap();
        builder.metadata("title", "Fixture").unwrap();
        for (name, title, seed) in [
            ("one.xhtml", "One", "alpha"),
            ("two.xhtml", "Two", "beta"),
            ("three.xhtml", "Three", "gamma"),
        ] {
            let body = xhtml(title, &paragraph(seed, 300));
            builder
                .add_content(EpubContent::new(name, body.as_bytes()).title(title))
                .unwrap();
        }
        let mut bytes = Vec::new();
        builder.generate(&mut bytes).unwrap();

        let chapters = EpubExtractor::new(1000).extract(Cursor::new(bytes)).unwrap();
        let titles: Vec<_> = chapters.iter().filter_map(|c| c.title.as_deref()).collect();
        assert_eq!(titles, ["One", "Two", "Three"]);
    }
}
