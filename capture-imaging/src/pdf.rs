//! Protocol PDF layout and writer
//!
//! Images are laid out in a fixed grid (cell size and images per row come
//! from [`PdfLayout`]), each with a label beneath. A new page starts when
//! the next row would cross the bottom margin. Coordinates are PDF points
//! with the origin at the top left; they are flipped when written.

use crate::transform::{self, TransformError};
use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, ImageDecoder};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::io::Cursor;

#[derive(Debug)]
pub enum PdfError {
    Image(TransformError),
    Write(String),
}

impl std::fmt::Display for PdfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PdfError::Image(e) => write!(f, "PDF image error: {}", e),
            PdfError::Write(msg) => write!(f, "PDF write error: {}", msg),
        }
    }
}

impl std::error::Error for PdfError {}

impl From<TransformError> for PdfError {
    fn from(err: TransformError) -> Self {
        PdfError::Image(err)
    }
}

impl From<lopdf::Error> for PdfError {
    fn from(err: lopdf::Error) -> Self {
        PdfError::Write(err.to_string())
    }
}

/// Page geometry in PDF points (A4 by default)
#[derive(Debug, Clone)]
pub struct PdfLayout {
    pub page_width: i64,
    pub page_height: i64,
    pub margin: i64,
    /// Rows must end above `page_height - bottom_margin`
    pub bottom_margin: i64,
    pub images_per_row: usize,
    pub cell_width: i64,
    pub cell_height: i64,
    pub label_height: i64,
    pub column_gap: i64,
    pub row_gap: i64,
}

impl Default for PdfLayout {
    fn default() -> Self {
        Self {
            page_width: 595,
            page_height: 842,
            margin: 56,
            bottom_margin: 85,
            images_per_row: 2,
            cell_width: 230,
            cell_height: 172,
            label_height: 14,
            column_gap: 20,
            row_gap: 12,
        }
    }
}

impl PdfLayout {
    fn row_height(&self) -> i64 {
        self.cell_height + self.label_height + self.row_gap
    }

    fn limit(&self) -> i64 {
        self.page_height - self.bottom_margin
    }
}

/// A JPEG ready to be embedded as a DCT stream
#[derive(Debug, Clone)]
pub struct PdfImage {
    pub label: String,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub grayscale: bool,
}

impl PdfImage {
    /// Wraps an existing JPEG. Non-JPEG input or colour spaces a DCT
    /// stream cannot carry as-is are re-encoded.
    pub fn from_jpeg(
        label: impl Into<String>,
        bytes: Vec<u8>,
        max_edge: u32,
        quality: u8,
    ) -> Result<Self, TransformError> {
        let label = label.into();
        let probed = JpegDecoder::new(Cursor::new(&bytes))
            .ok()
            .map(|decoder| (decoder.dimensions(), decoder.color_type()));

        match probed {
            Some(((width, height), ColorType::Rgb8)) if width > 0 && height > 0 => Ok(Self {
                label,
                jpeg: bytes,
                width,
                height,
                grayscale: false,
            }),
            Some(((width, height), ColorType::L8)) if width > 0 && height > 0 => Ok(Self {
                label,
                jpeg: bytes,
                width,
                height,
                grayscale: true,
            }),
            _ => Self::reencoded(label, &bytes, max_edge, quality),
        }
    }

    /// Decodes any supported format and re-encodes it as RGB JPEG
    pub fn reencoded(
        label: impl Into<String>,
        bytes: &[u8],
        max_edge: u32,
        quality: u8,
    ) -> Result<Self, TransformError> {
        let (jpeg, width, height) = transform::reencode_for_pdf(bytes, max_edge, quality)?;
        Ok(Self {
            label: label.into(),
            jpeg,
            width,
            height,
            grayscale: false,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PdfSection {
    pub title: String,
    pub images: Vec<PdfImage>,
}

/// Whole document: a title, a few header lines, then the image sections
#[derive(Debug, Clone, Default)]
pub struct ProtocolDocument {
    pub title: String,
    pub header_lines: Vec<String>,
    pub sections: Vec<PdfSection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Text {
        x: i64,
        y: i64,
        size: i64,
        text: String,
    },
    Image {
        section: usize,
        index: usize,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
}

/// Computes placements per page without touching image bytes
pub fn layout(doc: &ProtocolDocument, layout: &PdfLayout) -> Vec<Vec<Placement>> {
    let mut pages: Vec<Vec<Placement>> = vec![Vec::new()];
    let mut y = layout.margin;

    pages[0].push(Placement::Text {
        x: layout.margin,
        y,
        size: 18,
        text: doc.title.clone(),
    });
    y += 28;
    for line in &doc.header_lines {
        pages[0].push(Placement::Text {
            x: layout.margin,
            y,
            size: 10,
            text: line.clone(),
        });
        y += 14;
    }
    y += 10;

    let per_row = layout.images_per_row.max(1);

    for (section_index, section) in doc.sections.iter().enumerate() {
        if section.images.is_empty() {
            continue;
        }

        // Keep the heading together with the first row
        if y + 24 + layout.cell_height + layout.label_height > layout.limit() {
            pages.push(Vec::new());
            y = layout.margin;
        }
        if let Some(page) = pages.last_mut() {
            page.push(Placement::Text {
                x: layout.margin,
                y,
                size: 13,
                text: section.title.clone(),
            });
        }
        y += 24;

        let mut column = 0;
        for (index, image) in section.images.iter().enumerate() {
            if column == 0 && y + layout.cell_height + layout.label_height > layout.limit() {
                pages.push(Vec::new());
                y = layout.margin;
            }

            let x = layout.margin + column as i64 * (layout.cell_width + layout.column_gap);
            let (width, height) = fit_cell(image.width, image.height, layout);

            if let Some(page) = pages.last_mut() {
                page.push(Placement::Image {
                    section: section_index,
                    index,
                    x,
                    y,
                    width,
                    height,
                });
                page.push(Placement::Text {
                    x,
                    y: y + layout.cell_height + 2,
                    size: 8,
                    text: image.label.clone(),
                });
            }

            column += 1;
            if column == per_row {
                column = 0;
                y += layout.row_height();
            }
        }
        if column != 0 {
            y += layout.row_height();
        }
        y += 10;
    }

    pages
}

fn fit_cell(width: u32, height: u32, layout: &PdfLayout) -> (i64, i64) {
    if width == 0 || height == 0 {
        return (layout.cell_width, layout.cell_height);
    }
    let scale = (layout.cell_width as f64 / width as f64).min(layout.cell_height as f64 / height as f64);
    (
        ((width as f64 * scale) as i64).max(1),
        ((height as f64 * scale) as i64).max(1),
    )
}

fn pdf_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

/// Renders the document to PDF bytes
pub fn render(doc: &ProtocolDocument, layout_cfg: &PdfLayout) -> Result<Vec<u8>, PdfError> {
    let pages = layout(doc, layout_cfg);

    let mut pdf = Document::with_version("1.5");
    let pages_id = pdf.new_object_id();
    let font_id = pdf.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    // One XObject per image, shared across pages
    let mut image_ids: Vec<Vec<ObjectId>> = Vec::with_capacity(doc.sections.len());
    for section in &doc.sections {
        let mut ids = Vec::with_capacity(section.images.len());
        for image in &section.images {
            let color_space = if image.grayscale { "DeviceGray" } else { "DeviceRGB" };
            let stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => image.width as i64,
                    "Height" => image.height as i64,
                    "ColorSpace" => color_space,
                    "BitsPerComponent" => 8i64,
                    "Filter" => "DCTDecode",
                },
                image.jpeg.clone(),
            )
            .with_compression(false);
            ids.push(pdf.add_object(stream));
        }
        image_ids.push(ids);
    }

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for placements in &pages {
        let mut operations = Vec::new();
        let mut xobjects = lopdf::Dictionary::new();

        for placement in placements {
            match placement {
                Placement::Text { x, y, size, text } => {
                    let baseline = layout_cfg.page_height - y - size;
                    operations.push(Operation::new("BT", vec![]));
                    operations.push(Operation::new(
                        "Tf",
                        vec![Object::Name(b"F1".to_vec()), Object::Integer(*size)],
                    ));
                    operations.push(Operation::new(
                        "Td",
                        vec![Object::Integer(*x), Object::Integer(baseline)],
                    ));
                    operations.push(Operation::new(
                        "Tj",
                        vec![Object::string_literal(pdf_text(text))],
                    ));
                    operations.push(Operation::new("ET", vec![]));
                }
                Placement::Image {
                    section,
                    index,
                    x,
                    y,
                    width,
                    height,
                } => {
                    let Some(image_id) = image_ids.get(*section).and_then(|ids| ids.get(*index)) else {
                        continue;
                    };
                    let name = format!("Im{}_{}", section, index);
                    xobjects.set(name.as_bytes().to_vec(), Object::Reference(*image_id));

                    let bottom = layout_cfg.page_height - y - height;
                    operations.push(Operation::new("q", vec![]));
                    operations.push(Operation::new(
                        "cm",
                        vec![
                            Object::Integer(*width),
                            Object::Integer(0),
                            Object::Integer(0),
                            Object::Integer(*height),
                            Object::Integer(*x),
                            Object::Integer(bottom),
                        ],
                    ));
                    operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
                    operations.push(Operation::new("Q", vec![]));
                }
            }
        }

        let content = Content { operations };
        let content_id = pdf.add_object(Stream::new(dictionary! {}, content.encode()?));
        let resources_id = pdf.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
            "XObject" => xobjects,
        });
        let page_id = pdf.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let page_count = kids.len() as i64;
    pdf.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(layout_cfg.page_width),
                Object::Integer(layout_cfg.page_height),
            ],
        }),
    );
    let catalog_id = pdf.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    pdf.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    pdf.save_to(&mut out)
        .map_err(|e| PdfError::Write(e.to_string()))?;
    log::debug!("Rendered protocol PDF: {} pages, {} bytes", page_count, out.len());
    Ok(out)
}
