use crate::chunking::{build_chunks, ChunkingConfig};
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::models::{
    DocumentChunk, IngestionOptions, Metadata, PageDocument, DOC_ID_KEY, FILE_NAME_KEY,
    FILE_PATH_KEY, PAGE_LABEL_KEY,
};
use crate::IngestError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub fn is_pdf_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Lists the PDF files directly inside `folder`, sorted by path.
pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_pdf_path(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct DirectoryLoad {
    pub pages: Vec<PageDocument>,
    pub skipped_files: Vec<SkippedPdf>,
}

#[derive(Clone)]
pub struct DocumentLoader {
    extractor: Arc<dyn PdfExtractor>,
    options: IngestionOptions,
}

impl DocumentLoader {
    pub fn new(options: IngestionOptions) -> Result<Self, IngestError> {
        Self::with_extractor(options, Arc::new(LopdfExtractor))
    }

    pub fn with_extractor(
        options: IngestionOptions,
        extractor: Arc<dyn PdfExtractor>,
    ) -> Result<Self, IngestError> {
        ChunkingConfig::from(&options).validate()?;
        Ok(Self { extractor, options })
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    pub fn load_document(&self, path: &Path) -> Result<Vec<PageDocument>, IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.display().to_string()));
        }
        if !is_pdf_path(path) {
            return Err(IngestError::UnsupportedType(path.display().to_string()));
        }

        info!(path = %path.display(), "loading pdf");
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();
        let file_path = path.to_string_lossy().to_string();
        let doc_id = document_id(path);

        let pages = self
            .extractor
            .extract_pages(path)
            .inspect_err(|error| error!(path = %path.display(), %error, "failed to load pdf"))?;

        let documents = pages
            .into_iter()
            .map(|page| {
                let mut metadata = Metadata::new();
                metadata.insert(FILE_NAME_KEY.to_string(), Value::from(file_name.clone()));
                metadata.insert(FILE_PATH_KEY.to_string(), Value::from(file_path.clone()));
                metadata.insert(DOC_ID_KEY.to_string(), Value::from(doc_id.clone()));
                metadata.insert(PAGE_LABEL_KEY.to_string(), Value::from(page.number));
                PageDocument {
                    page_number: page.number,
                    text: page.text,
                    metadata,
                }
            })
            .collect::<Vec<_>>();

        info!(path = %path.display(), pages = documents.len(), "loaded pdf");
        Ok(documents)
    }

    /// Loads every PDF in `dir`, skipping files that fail instead of aborting.
    pub fn load_directory(&self, dir: &Path) -> Result<DirectoryLoad, IngestError> {
        if !dir.is_dir() {
            return Err(IngestError::NotADirectory(dir.display().to_string()));
        }

        let files = discover_pdf_files(dir);
        if files.is_empty() {
            warn!(dir = %dir.display(), "no pdf files found in directory");
        }

        let mut pages = Vec::new();
        let mut skipped_files = Vec::new();
        for path in files {
            match self.load_document(&path) {
                Ok(loaded) => pages.extend(loaded),
                Err(error) => {
                    error!(path = %path.display(), %error, "skipping pdf");
                    skipped_files.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            dir = %dir.display(),
            pages = pages.len(),
            skipped = skipped_files.len(),
            "loaded pdf directory"
        );
        Ok(DirectoryLoad {
            pages,
            skipped_files,
        })
    }

    pub fn process_documents(
        &self,
        pages: &[PageDocument],
    ) -> Result<Vec<DocumentChunk>, IngestError> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = build_chunks(pages, &self.options)?;
        info!(pages = pages.len(), chunks = chunks.len(), "split documents into chunks");
        Ok(chunks)
    }
}

fn document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extractor::PageText;
    use std::fs;
    use tempfile::tempdir;

    /// Treats the file contents as page text, one page per form feed.
    pub(crate) struct PlainTextExtractor;

    impl PdfExtractor for PlainTextExtractor {
        fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
            let raw = fs::read_to_string(path)?;
            if raw.starts_with("%broken") {
                return Err(IngestError::PdfParse("broken fixture".to_string()));
            }
            Ok(raw
                .split('\u{000c}')
                .enumerate()
                .map(|(index, text)| PageText {
                    number: index as u32 + 1,
                    text: text.to_string(),
                })
                .collect())
        }
    }

    pub(crate) fn text_loader() -> DocumentLoader {
        DocumentLoader::with_extractor(IngestionOptions::default(), Arc::new(PlainTextExtractor))
            .expect("default options are valid")
    }

    #[test]
    fn missing_file_is_not_found() {
        let result = text_loader().load_document(Path::new("/definitely/missing.pdf"));
        assert!(matches!(result, Err(IngestError::NotFound(_))));
    }

    #[test]
    fn non_pdf_is_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello")?;

        let result = text_loader().load_document(&path);
        assert!(matches!(result, Err(IngestError::UnsupportedType(_))));
        Ok(())
    }

    #[test]
    fn pages_carry_file_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("Guide.PDF");
        fs::write(&path, "Page one.\u{000c}Page two.")?;

        let pages = text_loader().load_document(&path)?;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].page_number, 2);
        assert_eq!(pages[0].metadata[FILE_NAME_KEY], Value::from("Guide.PDF"));
        assert_eq!(
            pages[0].metadata[FILE_PATH_KEY],
            Value::from(path.to_string_lossy().to_string())
        );
        Ok(())
    }

    #[test]
    fn directory_load_skips_failing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.pdf"), "Readable text.")?;
        fs::write(dir.path().join("b.pdf"), "%broken")?;
        fs::write(dir.path().join("c.txt"), "ignored")?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("nested").join("d.pdf"), "Not visited.")?;

        let loaded = text_loader().load_directory(dir.path())?;
        assert_eq!(loaded.pages.len(), 1);
        assert_eq!(loaded.skipped_files.len(), 1);
        assert_eq!(
            loaded.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("b.pdf")
        );
        Ok(())
    }

    #[test]
    fn missing_directory_is_rejected() {
        let result = text_loader().load_directory(Path::new("/definitely/missing"));
        assert!(matches!(result, Err(IngestError::NotADirectory(_))));
    }

    #[test]
    fn empty_directory_yields_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let loaded = text_loader().load_directory(dir.path())?;
        assert!(loaded.pages.is_empty());
        assert!(loaded.skipped_files.is_empty());
        Ok(())
    }
}
