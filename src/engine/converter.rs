// src/engine/converter.rs
//
// Naming patterns for batch save-as: turns each source image into a
// destination path inside one directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageFormat;

use crate::engine::image::Image;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaseConversion {
    #[default]
    Keep,
    Lower,
    Upper,
}

/// Destination naming for multi-image save-as.
///
/// Pattern tokens: `%f` is the source file stem, `%n` the counter
/// (zero-padded to `digits`, starting at `counter_start`), `%%` a literal
/// percent sign. Anything else is copied as is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriConverter {
    base_dir: PathBuf,
    pattern: String,
    case: CaseConversion,
    spaces_to_underscores: bool,
    counter_start: u32,
    digits: usize,
    format: Option<ImageFormat>,
}

impl UriConverter {
    pub fn new(base_dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            pattern: pattern.into(),
            case: CaseConversion::Keep,
            spaces_to_underscores: false,
            counter_start: 1,
            digits: 1,
            format: None,
        }
    }

    pub fn with_case(mut self, case: CaseConversion) -> Self {
        self.case = case;
        self
    }

    pub fn with_spaces_to_underscores(mut self, enabled: bool) -> Self {
        self.spaces_to_underscores = enabled;
        self
    }

    pub fn with_counter(mut self, start: u32, digits: usize) -> Self {
        self.counter_start = start;
        self.digits = digits.max(1);
        self
    }

    /// Force the output format (and extension) instead of keeping the
    /// source's.
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// File name for the `index`-th source.
    pub fn file_name(&self, source: &Path, index: usize) -> String {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut name = String::with_capacity(self.pattern.len() + stem.len());
        let mut chars = self.pattern.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                name.push(c);
                continue;
            }
            match chars.peek() {
                Some('f') => {
                    chars.next();
                    name.push_str(&stem);
                }
                Some('n') => {
                    chars.next();
                    let counter = u64::from(self.counter_start) + index as u64;
                    name.push_str(&format!("{counter:0width$}", width = self.digits));
                }
                Some('%') => {
                    chars.next();
                    name.push('%');
                }
                _ => name.push('%'),
            }
        }
        if name.is_empty() {
            name = stem;
        }

        name = match self.case {
            CaseConversion::Keep => name,
            CaseConversion::Lower => name.to_lowercase(),
            CaseConversion::Upper => name.to_uppercase(),
        };
        if self.spaces_to_underscores {
            name = name.replace(' ', "_");
        }

        let extension = match self.format {
            Some(format) => format.extensions_str().first().map(|e| e.to_string()),
            None => source
                .extension()
                .map(|e| e.to_string_lossy().into_owned()),
        };
        match extension {
            Some(ext) if !ext.is_empty() => format!("{name}.{ext}"),
            _ => name,
        }
    }

    pub fn destination(&self, source: &Path, index: usize) -> PathBuf {
        self.base_dir.join(self.file_name(source, index))
    }

    /// True when no two images map onto the same destination.
    pub fn check_unique(&self, images: &[Arc<Image>]) -> bool {
        let mut seen = HashSet::with_capacity(images.len());
        images
            .iter()
            .enumerate()
            .all(|(i, image)| seen.insert(self.destination(&image.path(), i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        let conv = UriConverter::new("/out", "%f-%n-100%%").with_counter(7, 3);
        assert_eq!(conv.file_name(Path::new("/in/cat.png"), 2), "cat-009-100%.png");
    }

    #[test]
    fn test_unknown_token_is_literal() {
        let conv = UriConverter::new("/out", "x%q%");
        assert_eq!(conv.file_name(Path::new("a.jpg"), 0), "x%q%.jpg");
    }

    #[test]
    fn test_empty_pattern_keeps_stem() {
        let conv = UriConverter::new("/out", "");
        assert_eq!(conv.destination(Path::new("/in/dog.gif"), 0), PathBuf::from("/out/dog.gif"));
    }

    #[test]
    fn test_case_spaces_and_format() {
        let conv = UriConverter::new("/out", "My %f")
            .with_case(CaseConversion::Lower)
            .with_spaces_to_underscores(true)
            .with_format(ImageFormat::Jpeg);
        assert_eq!(conv.file_name(Path::new("Big Cat.PNG"), 0), "my_big_cat.jpg");

        let upper = UriConverter::new("/out", "%f").with_case(CaseConversion::Upper);
        assert_eq!(upper.file_name(Path::new("a.png"), 0), "A.png");
    }

    #[test]
    fn test_check_unique() {
        let images = vec![Image::new("/a/x.png"), Image::new("/b/x.png")];
        assert!(!UriConverter::new("/out", "%f").check_unique(&images));
        assert!(UriConverter::new("/out", "%f-%n").check_unique(&images));
        assert!(UriConverter::new("/out", "fixed").check_unique(&images[..1]));
    }
}
