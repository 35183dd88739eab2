//! Protocol PDF generation.
//!
//! Every image is sourced from the first tier that yields usable bytes:
//! the local PDF cache, the server PDF derivative, then the original
//! downloaded and re-encoded. An image no tier can deliver is skipped.

use crate::database::DurableStore;
use crate::error::CaptureError;
use crate::models::{BlobRef, ImageMetadata};
use crate::services::transport::ImageFetcher;
use capture_imaging::pdf;
use capture_imaging::{PdfImage, PdfLayout, PdfSection, ProtocolDocument};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Re-encode settings for originals downloaded as a last resort
const FALLBACK_MAX_EDGE: u32 = 800;
const FALLBACK_QUALITY: u8 = 20;

/// Known image sets in document order with their headings
const SECTIONS: &[(&str, &str)] = &[
    ("vehicle", "Vehicle"),
    ("document", "Documents"),
    ("damage", "Damages"),
    ("odometer", "Odometer"),
    ("fuel", "Fuel level"),
];

fn path_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// On-disk cache of PDF derivatives, `dir/<owner>/<image id>.jpg`
#[derive(Debug, Clone)]
pub struct PdfCache {
    dir: PathBuf,
}

impl PdfCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.dir.join(path_component(owner))
    }

    fn path(&self, owner: &str, image_id: &str) -> PathBuf {
        self.owner_dir(owner).join(format!("{}.jpg", path_component(image_id)))
    }

    pub async fn put(&self, owner: &str, image_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path(owner, image_id);
        tokio::fs::create_dir_all(self.owner_dir(owner)).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn get(&self, owner: &str, image_id: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.path(owner, image_id)).await.ok()
    }

    /// Removes every cached derivative of `owner`; returns how many
    pub async fn clear(&self, owner: &str) -> std::io::Result<usize> {
        self.clear_except(owner, &HashSet::new()).await
    }

    /// Like [`PdfCache::clear`], but leaves the files in `keep` in place.
    /// The owner directory is removed only once it is empty.
    pub async fn clear_except(&self, owner: &str, keep: &HashSet<PathBuf>) -> std::io::Result<usize> {
        let dir = self.owner_dir(owner);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut removed = 0;
        let mut kept = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if keep.contains(&path) {
                kept += 1;
                continue;
            }
            tokio::fs::remove_file(path).await?;
            removed += 1;
        }
        if kept == 0 {
            tokio::fs::remove_dir(&dir).await?;
        }
        Ok(removed)
    }
}

/// One image as the PDF generator sees it
#[derive(Debug, Clone, PartialEq)]
pub struct PdfSourceImage {
    pub id: String,
    pub label: String,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
}

impl From<&ImageMetadata> for PdfSourceImage {
    fn from(image: &ImageMetadata) -> Self {
        Self {
            id: image.id.clone(),
            label: image.filename.clone(),
            url: image.url.clone(),
            pdf_url: image.pdf_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolPdfRequest {
    pub protocol_id: String,
    pub title: String,
    pub header_lines: Vec<String>,
    /// Images keyed by media type
    pub image_sets: BTreeMap<String, Vec<PdfSourceImage>>,
}

impl ProtocolPdfRequest {
    pub fn new(protocol_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, media_type: &str, images: Vec<PdfSourceImage>) -> Self {
        self.image_sets.entry(media_type.to_string()).or_default().extend(images);
        self
    }

    /// Known sets first in fixed order, anything else after by name
    fn ordered_sets(&self) -> Vec<(String, &[PdfSourceImage])> {
        let mut sets = Vec::new();
        for (key, title) in SECTIONS {
            if let Some(images) = self.image_sets.get(*key) {
                sets.push((title.to_string(), images.as_slice()));
            }
        }
        for (key, images) in &self.image_sets {
            if !SECTIONS.iter().any(|(known, _)| known == key) {
                sets.push((key.clone(), images.as_slice()));
            }
        }
        sets
    }
}

/// Where the images of the last document came from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PdfStats {
    pub from_local_cache: usize,
    pub from_pdf_derivative: usize,
    pub from_original: usize,
    /// Images skipped because no tier delivered
    pub errors: usize,
    pub pages: usize,
}

enum Tier {
    LocalCache,
    PdfDerivative,
    Original,
}

pub struct ProtocolPdfService {
    fetcher: Arc<dyn ImageFetcher>,
    cache: Option<PdfCache>,
    /// Queue lookups so cache files still waiting for upload survive clearing
    store: Option<DurableStore>,
    layout: PdfLayout,
    last_stats: Mutex<Option<PdfStats>>,
}

impl ProtocolPdfService {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, cache: Option<PdfCache>) -> Self {
        Self {
            fetcher,
            cache,
            store: None,
            layout: PdfLayout::default(),
            last_stats: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: DurableStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_layout(mut self, layout: PdfLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Statistics of the most recent successful generation
    pub fn last_stats(&self) -> Option<PdfStats> {
        self.last_stats.lock().ok().and_then(|g| g.clone())
    }

    /// Builds a request from the stored image rows of a protocol
    pub async fn request_from_store(
        store: &DurableStore,
        protocol_id: &str,
        title: &str,
    ) -> Result<ProtocolPdfRequest, CaptureError> {
        let mut request = ProtocolPdfRequest::new(protocol_id, title);
        for image in store.get_protocol_images(protocol_id).await? {
            request
                .image_sets
                .entry(image.media_type.clone())
                .or_default()
                .push(PdfSourceImage::from(&image));
        }
        Ok(request)
    }

    async fn convert(label: String, bytes: Vec<u8>, reencode: bool) -> Option<PdfImage> {
        let result = tokio::task::spawn_blocking(move || {
            if reencode {
                PdfImage::reencoded(label, &bytes, FALLBACK_MAX_EDGE, FALLBACK_QUALITY)
            } else {
                PdfImage::from_jpeg(label, bytes, FALLBACK_MAX_EDGE, FALLBACK_QUALITY)
            }
        })
        .await;
        match result {
            Ok(Ok(image)) => Some(image),
            Ok(Err(e)) => {
                log::debug!("Unusable PDF source: {}", e);
                None
            }
            Err(e) => {
                log::error!("PDF image conversion task failed: {}", e);
                None
            }
        }
    }

    async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        match self.fetcher.fetch(url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Fetching {} failed: {}", url, e);
                None
            }
        }
    }

    async fn source(&self, owner: &str, image: &PdfSourceImage) -> Option<(PdfImage, Tier)> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(owner, &image.id).await {
                if let Some(pdf_image) = Self::convert(image.label.clone(), bytes, false).await {
                    return Some((pdf_image, Tier::LocalCache));
                }
            }
        }
        if let Some(url) = &image.pdf_url {
            if let Some(bytes) = self.fetch(url).await {
                if let Some(pdf_image) = Self::convert(image.label.clone(), bytes, false).await {
                    return Some((pdf_image, Tier::PdfDerivative));
                }
            }
        }
        if let Some(url) = &image.url {
            if let Some(bytes) = self.fetch(url).await {
                if let Some(pdf_image) = Self::convert(image.label.clone(), bytes, true).await {
                    return Some((pdf_image, Tier::Original));
                }
            }
        }
        None
    }

    /// Renders the protocol document. On success the local PDF cache of
    /// the protocol is cleared.
    pub async fn generate(&self, request: &ProtocolPdfRequest) -> Result<(Vec<u8>, PdfStats), CaptureError> {
        let mut stats = PdfStats::default();
        let mut document = ProtocolDocument {
            title: request.title.clone(),
            header_lines: request.header_lines.clone(),
            sections: Vec::new(),
        };

        for (title, images) in request.ordered_sets() {
            let mut section = PdfSection {
                title,
                images: Vec::with_capacity(images.len()),
            };
            for image in images {
                match self.source(&request.protocol_id, image).await {
                    Some((pdf_image, tier)) => {
                        match tier {
                            Tier::LocalCache => stats.from_local_cache += 1,
                            Tier::PdfDerivative => stats.from_pdf_derivative += 1,
                            Tier::Original => stats.from_original += 1,
                        }
                        section.images.push(pdf_image);
                    }
                    None => {
                        log::warn!("No source for image {} ({}), skipping", image.id, image.label);
                        stats.errors += 1;
                    }
                }
            }
            document.sections.push(section);
        }

        let layout = self.layout.clone();
        let (bytes, pages) = tokio::task::spawn_blocking(move || {
            let pages = pdf::layout(&document, &layout).len();
            pdf::render(&document, &layout).map(|bytes| (bytes, pages))
        })
        .await
        .map_err(|e| CaptureError::Other(format!("PDF render task failed: {}", e)))??;
        stats.pages = pages;

        log::info!(
            "Generated PDF for {}: {} pages, cache {}, derivative {}, original {}, errors {}",
            request.protocol_id,
            stats.pages,
            stats.from_local_cache,
            stats.from_pdf_derivative,
            stats.from_original,
            stats.errors
        );
        if let Ok(mut guard) = self.last_stats.lock() {
            *guard = Some(stats.clone());
        }
        self.clear_pdf_cache(&request.protocol_id).await;
        Ok((bytes, stats))
    }

    pub async fn clear_pdf_cache(&self, owner: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut pending = HashSet::new();
        if let Some(store) = &self.store {
            match store.get_protocol_queued_tasks(owner).await {
                Ok(tasks) => pending.extend(tasks.into_iter().filter_map(|t| match t.blob_ref {
                    BlobRef::File(path) => Some(path),
                    BlobRef::Memory(_) => None,
                })),
                Err(e) => {
                    log::warn!("Cannot check queued uploads of {}, keeping PDF cache: {}", owner, e);
                    return;
                }
            }
        }
        if !pending.is_empty() {
            log::debug!("Keeping {} cached PDF images of {} for queued uploads", pending.len(), owner);
        }
        match cache.clear_except(owner, &pending).await {
            Ok(0) => {}
            Ok(removed) => log::debug!("Cleared {} cached PDF images of {}", removed, owner),
            Err(e) => log::warn!("Could not clear PDF cache of {}: {}", owner, e),
        }
    }
}
