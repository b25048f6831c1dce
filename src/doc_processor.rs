use std::path::Path;

/// Characters of a window's beginning used to locate its page.
const PAGE_LOOKUP_CHARS: usize = 40;

/// Separator placed between pages when they are chunked as one text.
const PAGE_SEPARATOR: &str = "\n\n";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),
    #[error("PDF parse error: {0}")]
    Pdf(String),
    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Text of one page, numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// An overlapping slice of document text, the unit of embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    pub text: String,
    pub page: Option<u32>,
}

/// Guess a media type from a file name's extension.
pub fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "txt" => Some("text/plain"),
        "md" | "markdown" => Some("text/markdown"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

/// Decode stored document bytes into page texts.
pub fn extract_pages(media_type: &str, bytes: &[u8]) -> Result<Vec<PageText>, DocumentError> {
    match media_type {
        "application/pdf" => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
                .map_err(|e| DocumentError::Pdf(e.to_string()))?;
            Ok(number_pages(pages.iter().map(String::as_str)))
        }
        "text/plain" | "text/markdown" => Ok(split_pages(&String::from_utf8(bytes.to_vec())?)),
        other => Err(DocumentError::Unsupported(other.to_string())),
    }
}

/// Split extracted text into pages on form feeds. Empty pages keep their number.
pub fn split_pages(text: &str) -> Vec<PageText> {
    number_pages(text.split('\x0C'))
}

fn number_pages<'a>(pages: impl Iterator<Item = &'a str>) -> Vec<PageText> {
    pages
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| PageText {
            number: i as u32 + 1,
            text: page.trim().to_string(),
        })
        .collect()
}

/// Overlapping fixed-size windows as (start, end, trimmed text), in char offsets.
fn windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<(usize, usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push((start, end, chunk));
        }
        if end >= chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Chunk a paged document as one continuous text. A window lying inside a
/// single page carries that page's number; windows crossing a page boundary
/// carry none.
pub fn chunk_pages(pages: &[PageText], chunk_size: usize, overlap: usize) -> Vec<TextWindow> {
    let mut joined = String::new();
    let mut spans = Vec::with_capacity(pages.len());
    let mut offset = 0;
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            joined.push_str(PAGE_SEPARATOR);
            offset += PAGE_SEPARATOR.chars().count();
        }
        let len = page.text.chars().count();
        spans.push((offset, offset + len, page.number));
        joined.push_str(&page.text);
        offset += len;
    }

    windows(&joined, chunk_size, overlap)
        .into_iter()
        .map(|(start, end, text)| {
            let page = spans
                .iter()
                .find(|(from, to, _)| *from <= start && end <= *to)
                .map(|(_, _, number)| *number);
            TextWindow { text, page }
        })
        .collect()
}

/// Fill in missing page numbers by finding the page whose text contains the
/// beginning of the window. The lookup stops at the first page separator so a
/// window is attributed to the page it starts on. Pages at or after the
/// preceding window's page are searched first.
pub fn recover_missing_pages(windows: &mut [TextWindow], pages: &[PageText]) {
    let mut floor = 0;
    for window in windows.iter_mut() {
        if window.page.is_none() {
            window.page = locate_page(&window.text, pages, floor);
        }
        if let Some(page) = window.page {
            floor = page;
        }
    }
}

fn locate_page(text: &str, pages: &[PageText], floor: u32) -> Option<u32> {
    let head = text
        .split(PAGE_SEPARATOR)
        .map(str::trim)
        .find(|segment| !segment.is_empty())?;
    let needle: String = head.chars().take(PAGE_LOOKUP_CHARS).collect();
    let contains = |page: &&PageText| page.text.contains(&needle);
    pages
        .iter()
        .filter(|page| page.number >= floor)
        .find(contains)
        .or_else(|| pages.iter().find(contains))
        .map(|page| page.number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
        windows(text, chunk_size, overlap)
            .into_iter()
            .map(|(_, _, chunk)| chunk)
            .collect()
    }

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_chunk_text_short() {
        let chunks = chunk_text("Hello world", 100, 20);
        assert_eq!(chunks, vec!["Hello world"]);
    }

    #[test]
    fn test_chunk_text_overlap() {
        let text = "a".repeat(100);
        let chunks = chunk_text(&text, 40, 10);
        // windows start at 0, 30, 60
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 40);
        assert_eq!(chunks[2].len(), 40);
    }

    #[test]
    fn chunk_text_counts_chars_not_bytes() {
        let text = "é".repeat(10);
        let chunks = chunk_text(&text, 4, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 4);
    }

    #[test]
    fn chunk_text_overlap_not_smaller_than_size_still_terminates() {
        let chunks = chunk_text("abcdef", 3, 5);
        assert_eq!(chunks.first().map(String::as_str), Some("abc"));
        assert_eq!(chunks.last().map(String::as_str), Some("def"));
    }

    #[test]
    fn split_pages_on_form_feed() {
        let pages = split_pages("one\x0C\x0Cthree \x0C");
        assert_eq!(pages, vec![page(1, "one"), page(3, "three")]);
    }

    #[test]
    fn plain_text_extracts_as_single_page() {
        let pages = extract_pages("text/plain", b"just text").unwrap();
        assert_eq!(pages, vec![page(1, "just text")]);
    }

    fn pdf(pages: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn pdf_pages_keep_their_numbers() {
        let bytes = pdf(&["First page pump text", "Second page seal text"]);
        let pages = extract_pages("application/pdf", &bytes).unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        assert!(pages[0].text.contains("pump"));
        assert!(!pages[0].text.contains("Second"));
        assert_eq!(pages[1].number, 2);
        assert!(pages[1].text.contains("seal"));
    }

    #[test]
    fn pdf_chunks_carry_page_numbers() {
        let bytes = pdf(&["Mount the pump on the base plate", "Replace the seal every year"]);
        let pages = extract_pages("application/pdf", &bytes).unwrap();
        let mut windows = chunk_pages(&pages, 20, 0);
        recover_missing_pages(&mut windows, &pages);

        assert!(windows.len() > 2);
        assert_eq!(windows.first().and_then(|w| w.page), Some(1));
        assert_eq!(windows.last().and_then(|w| w.page), Some(2));
        assert!(windows.iter().all(|w| w.page.is_some()));
    }

    #[test]
    fn unreadable_pdf_is_a_parse_error() {
        let err = extract_pages("application/pdf", b"%PDF-1.4 truncated").unwrap_err();
        assert!(matches!(err, DocumentError::Pdf(_)));
    }

    #[test]
    fn unsupported_media_type() {
        let err = extract_pages("image/png", b"").unwrap_err();
        assert!(matches!(err, DocumentError::Unsupported(t) if t == "image/png"));
    }

    #[test]
    fn media_type_by_extension() {
        assert_eq!(media_type_for(Path::new("a/b/Manual.PDF")), Some("application/pdf"));
        assert_eq!(media_type_for(Path::new("notes.md")), Some("text/markdown"));
        assert_eq!(media_type_for(Path::new("data.bin")), None);
    }

    #[test]
    fn windows_crossing_pages_have_no_page() {
        let pages = vec![page(1, &"a".repeat(10)), page(2, &"b".repeat(10))];
        let windows = chunk_pages(&pages, 8, 0);
        // joined: 10 a's, 2 separator chars, 10 b's = 22 chars; windows at 0, 8, 16
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].page, Some(1));
        assert_eq!(windows[1].page, None);
        assert_eq!(windows[2].page, Some(2));
    }

    #[test]
    fn missing_pages_recovered_from_page_text() {
        let p1 = "Pump P-100 installation guide. Mount the base plate first.";
        let p2 = "Electrical wiring: connect the motor leads to terminals U V W.";
        let p3 = "Maintenance schedule: replace the mechanical seal every 8000 hours of operation.";
        let pages = vec![page(1, p1), page(2, p2), page(3, p3)];

        let mut windows = vec![
            TextWindow { text: p1[..30].into(), page: Some(1) },
            TextWindow { text: p1[25..].into(), page: Some(1) },
            TextWindow { text: p2[..30].into(), page: Some(2) },
            TextWindow { text: p2[25..].into(), page: Some(2) },
            TextWindow { text: p3[..30].into(), page: Some(3) },
            TextWindow { text: p3[25..60].into(), page: None },
            TextWindow { text: p3[55..].into(), page: None },
        ];
        recover_missing_pages(&mut windows, &pages);

        let pages_found: Vec<Option<u32>> = windows.iter().map(|w| w.page).collect();
        assert_eq!(
            pages_found,
            vec![Some(1), Some(1), Some(2), Some(2), Some(3), Some(3), Some(3)]
        );
    }

    #[test]
    fn unmatched_window_leaves_page_empty() {
        let pages = vec![page(1, "alpha")];
        let mut windows = vec![TextWindow { text: "omega".into(), page: None }];
        recover_missing_pages(&mut windows, &pages);
        assert_eq!(windows[0].page, None);
    }

    #[test]
    fn chunk_then_recover_assigns_every_window() {
        let pages = vec![
            page(1, &"first page text. ".repeat(6)),
            page(2, &"second page text. ".repeat(6)),
            page(3, &"third page text. ".repeat(6)),
        ];
        let mut windows = chunk_pages(&pages, 60, 10);
        assert!(windows.iter().any(|w| w.page.is_none()));
        recover_missing_pages(&mut windows, &pages);
        assert!(windows.iter().all(|w| w.page.is_some()));
    }
}
