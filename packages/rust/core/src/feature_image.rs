//! Promotional composite of audiobook covers.
//!
//! Layout is table-driven: for `n` covers, `SIZES[n][i]` is the edge length
//! of cover `i` relative to the canvas height and `POSITIONS[n][i]` places it
//! within the free space left on each axis. Row 0 of both tables is unused.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use bookgen_shared::{BookGenError, Result};

/// Canvas size in pixels.
pub const WIDTH: u32 = 1200;
pub const HEIGHT: u32 = 628;

const CORNER_RADIUS: u32 = 20;
const SHADOW_OFFSET: u32 = 10;
const SHADOW_BLUR: u32 = 10;
const BACKGROUND_BLUR: u32 = 75;

const SIZES: [&[f64]; 7] = [
    &[0.0],
    &[0.8],
    &[0.7, 0.7],
    &[0.74, 0.55, 0.55],
    &[0.65, 0.65, 0.65, 0.65],
    &[0.7, 0.42, 0.42, 0.42, 0.42],
    &[0.45, 0.45, 0.45, 0.45, 0.45, 0.45],
];

const POSITIONS: [&[(f64, f64)]; 7] = [
    &[(0.0, 0.0)],
    &[(0.5, 0.5)],
    &[(0.15, 0.5), (0.85, 0.5)],
    &[(0.5, 0.5), (0.1, 0.5), (0.9, 0.5)],
    &[(0.1, 0.9), (0.37, 0.63), (0.63, 0.37), (0.9, 0.1)],
    &[(0.5, 0.5), (0.1, 0.1), (0.1, 0.9), (0.9, 0.1), (0.9, 0.9)],
    &[
        (0.1, 0.05),
        (0.5, 0.05),
        (0.9, 0.05),
        (0.1, 0.95),
        (0.5, 0.95),
        (0.9, 0.95),
    ],
];

/// Most covers a single composition can hold.
pub const MAX_COVERS: usize = SIZES.len() - 1;

/// Where one cover goes on the canvas, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

/// Placements for `count` square covers, or `None` when no layout exists.
pub fn layout(count: usize) -> Option<Vec<Placement>> {
    if count == 0 || count > MAX_COVERS {
        return None;
    }
    let (width, height) = (f64::from(WIDTH), f64::from(HEIGHT));
    Some(
        SIZES[count]
            .iter()
            .zip(POSITIONS[count])
            .map(|(relative, (px, py))| {
                let size = (height * relative).round();
                Placement {
                    x: ((width - size) * px).round(),
                    y: ((height - size) * py).round(),
                    size,
                }
            })
            .collect(),
    )
}

/// Cover lists to compose: the first five covers (only three when fewer
/// than five exist), once per rotation so every cover gets the front spot.
pub fn cover_sets(image_urls: &[String]) -> Vec<Vec<String>> {
    let mut covers: Vec<String> = image_urls.iter().take(5).cloned().collect();
    if covers.len() < 5 {
        covers.truncate(3);
    }
    let mut sets = Vec::with_capacity(covers.len());
    for _ in 0..covers.len() {
        sets.push(covers.clone());
        covers.rotate_right(1);
    }
    sets
}

/// Renders a set of cover images into one picture.
#[async_trait]
pub trait ImageComposer: Send + Sync {
    /// Compose `covers` (image URLs) and write the result at `output`,
    /// returning the path written.
    async fn compose(&self, covers: &[String], output: &Path) -> Result<PathBuf>;
}

/// Writes the composition as an SVG that references the cover URLs.
#[derive(Debug, Clone, Default)]
pub struct SvgComposer;

impl SvgComposer {
    pub fn render(covers: &[String]) -> Result<String> {
        let placements = layout(covers.len()).ok_or_else(|| {
            BookGenError::validation(format!(
                "feature image needs 1 to {MAX_COVERS} covers, got {}",
                covers.len()
            ))
        })?;

        let mut svg = String::new();
        // Writing to a String cannot fail.
        let _ = write!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}">"#
        );
        svg.push_str("<defs>");
        let _ = write!(
            svg,
            r#"<filter id="background-blur"><feGaussianBlur stdDeviation="{BACKGROUND_BLUR}"/></filter>"#
        );
        let _ = write!(
            svg,
            r#"<filter id="shadow" x="-20%" y="-20%" width="140%" height="140%"><feDropShadow dx="{SHADOW_OFFSET}" dy="{SHADOW_OFFSET}" stdDeviation="{SHADOW_BLUR}" flood-color="black" flood-opacity="0.6"/></filter>"#
        );
        for (i, p) in placements.iter().enumerate() {
            let _ = write!(
                svg,
                r#"<clipPath id="cover-{i}"><rect x="{}" y="{}" width="{}" height="{}" rx="{CORNER_RADIUS}" ry="{CORNER_RADIUS}"/></clipPath>"#,
                p.x, p.y, p.size, p.size
            );
        }
        svg.push_str("</defs>");

        // Background: first cover turned a quarter, stretched over the
        // canvas width and centred vertically, then blurred and darkened.
        let side = f64::from(WIDTH);
        let offset = (f64::from(HEIGHT) - side) / 2.0;
        let _ = write!(
            svg,
            r#"<g filter="url(#background-blur)"><image href="{href}" xlink:href="{href}" x="0" y="{offset}" width="{side}" height="{side}" preserveAspectRatio="xMidYMid slice" transform="rotate(-90 {cx} {cy})"/></g>"#,
            href = escape_attr(&covers[0]),
            cx = side / 2.0,
            cy = f64::from(HEIGHT) / 2.0,
        );
        let _ = write!(
            svg,
            r#"<rect width="{WIDTH}" height="{HEIGHT}" fill="black" fill-opacity="0.5"/>"#
        );

        // The first cover is drawn last so it sits on top.
        for (i, (cover, p)) in covers.iter().zip(&placements).enumerate().rev() {
            let _ = write!(
                svg,
                r#"<g filter="url(#shadow)"><image href="{href}" xlink:href="{href}" x="{}" y="{}" width="{}" height="{}" preserveAspectRatio="xMidYMid slice" clip-path="url(#cover-{i})"/></g>"#,
                p.x,
                p.y,
                p.size,
                p.size,
                href = escape_attr(cover),
            );
        }
        svg.push_str("</svg>\n");
        Ok(svg)
    }
}

#[async_trait]
impl ImageComposer for SvgComposer {
    #[instrument(skip_all, fields(covers = covers.len(), output = %output.display()))]
    async fn compose(&self, covers: &[String], output: &Path) -> Result<PathBuf> {
        let svg = Self::render(covers)?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BookGenError::io(parent, e))?;
        }
        tokio::fs::write(output, svg)
            .await
            .map_err(|e| BookGenError::io(output, e))?;
        debug!("feature image written");
        Ok(output.to_path_buf())
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
