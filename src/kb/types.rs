use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable chunk ID: `<kind>_<normalized_source>_<locator>_<chunk_index>`.
pub type ChunkId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Pdf,
    Spreadsheet,
    Json,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Pdf => "pdf",
            ChunkKind::Spreadsheet => "spreadsheet",
            ChunkKind::Json => "json",
        }
    }
}

/// Where inside the source file a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum Locator {
    Page(u32),
    Sheet(String),
    /// Named table or top-level key of a structured (JSON) document.
    Section(String),
}

impl Locator {
    fn id_part(&self) -> String {
        match self {
            Locator::Page(p) => p.to_string(),
            Locator::Sheet(s) | Locator::Section(s) => normalize_id_part(s),
        }
    }
}

/// A bounded text segment handed over by the (external) ingestion step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub source_file: String,
    pub kind: ChunkKind,
    pub locator: Locator,
    pub chunk_index: u32,
    /// e.g. "tourism", "financial_report"
    pub domain_tag: String,
    /// Year or quarter label when the source states one.
    #[serde(default)]
    pub period: Option<String>,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        format!(
            "{}_{}_{}_{}",
            self.kind.as_str(),
            normalize_id_part(&self.source_file),
            self.locator.id_part(),
            self.chunk_index
        )
    }

    /// Human-readable citation, e.g. `annual_report.pdf, page 4`.
    pub fn citation(&self) -> String {
        match &self.locator {
            Locator::Page(p) => format!("{}, page {}", self.source_file, p),
            Locator::Sheet(s) => format!("{}, sheet '{}'", self.source_file, s),
            Locator::Section(s) => format!("{}, section '{}'", self.source_file, s),
        }
    }
}

/// Lowercase, collapse runs of non-alphanumerics into `_`, trim `_` at both ends.
pub fn normalize_id_part(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// A chunk as persisted: content plus its embedding and bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub chunk: Chunk,
    /// blake3 hex of the chunk text.
    pub content_hash: String,
    /// Monotonic ingestion order; breaks relevance ties.
    pub seq: u64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    pub chunk: Chunk,
    pub citation: String,
    /// 0..=100, one decimal.
    pub relevance_score: f64,
    /// Cosine distance, kept for debugging.
    pub distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub kind: Option<ChunkKind>,
    pub domain_tag: Option<String>,
}

impl SearchFilters {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.kind.map_or(true, |k| k == chunk.kind)
            && self
                .domain_tag
                .as_deref()
                .map_or(true, |d| d.eq_ignore_ascii_case(&chunk.domain_tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbStats {
    pub total_chunks: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// Outcome of one `ingest_chunks` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(locator: Locator) -> Chunk {
        Chunk {
            text: "Occupancy reached 78% in Q2 2025.".to_string(),
            source_file: "Qatar Tourism -- Annual Report 2024.pdf".to_string(),
            kind: ChunkKind::Pdf,
            locator,
            chunk_index: 2,
            domain_tag: "tourism".to_string(),
            period: Some("Q2 2025".to_string()),
        }
    }

    #[test]
    fn test_normalize_id_part() {
        assert_eq!(
            normalize_id_part("  Qatar Tourism -- Annual Report 2024.pdf "),
            "qatar_tourism_annual_report_2024_pdf"
        );
        assert_eq!(normalize_id_part("__a__b__"), "a_b");
        assert_eq!(normalize_id_part("***"), "");
    }

    #[test]
    fn test_chunk_id_page() {
        assert_eq!(
            chunk(Locator::Page(14)).id(),
            "pdf_qatar_tourism_annual_report_2024_pdf_14_2"
        );
    }

    #[test]
    fn test_chunk_id_sheet_normalized() {
        let mut c = chunk(Locator::Sheet("Q2 Revenue".to_string()));
        c.kind = ChunkKind::Spreadsheet;
        assert_eq!(
            c.id(),
            "spreadsheet_qatar_tourism_annual_report_2024_pdf_q2_revenue_2"
        );
    }

    #[test]
    fn test_citations() {
        assert_eq!(
            chunk(Locator::Page(3)).citation(),
            "Qatar Tourism -- Annual Report 2024.pdf, page 3"
        );
        assert_eq!(
            chunk(Locator::Sheet("Rates".to_string())).citation(),
            "Qatar Tourism -- Annual Report 2024.pdf, sheet 'Rates'"
        );
    }

    #[test]
    fn test_filters() {
        let c = chunk(Locator::Page(1));
        assert!(SearchFilters::default().matches(&c));
        let f = SearchFilters {
            kind: Some(ChunkKind::Spreadsheet),
            domain_tag: None,
        };
        assert!(!f.matches(&c));
        let f = SearchFilters {
            kind: None,
            domain_tag: Some("Tourism".to_string()),
        };
        assert!(f.matches(&c));
    }
}
