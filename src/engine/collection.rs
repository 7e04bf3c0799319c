// src/engine/collection.rs
//
// Ordered set of images for one viewer window.

use std::path::Path;
use std::sync::Arc;

use crate::engine::image::Image;
use crate::engine::job::ModelOutput;

/// Images sorted by collate key (then path), one entity per path.
///
/// The collection holds one strong reference per image; removing an image
/// destroys the entity once no job refers to it any more.
#[derive(Debug, Default)]
pub struct ImageCollection {
    images: Vec<Arc<Image>>,
}

fn sort_key(image: &Image) -> (String, std::path::PathBuf) {
    (image.collate_key(), image.path())
}

impl ImageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_model(output: ModelOutput) -> Self {
        let mut collection = Self::new();
        collection.extend(output.images);
        collection
    }

    /// Insert in order. Returns false if an image with the same path is
    /// already present.
    pub fn add(&mut self, image: Arc<Image>) -> bool {
        if self.find(&image.path()).is_some() {
            return false;
        }
        let key = sort_key(&image);
        let at = match self
            .images
            .binary_search_by(|probe| sort_key(probe).cmp(&key))
        {
            Ok(at) | Err(at) => at,
        };
        self.images.insert(at, image);
        true
    }

    /// Returns how many images were actually added.
    pub fn extend(&mut self, images: impl IntoIterator<Item = Arc<Image>>) -> usize {
        images
            .into_iter()
            .map(|image| self.add(image))
            .filter(|added| *added)
            .count()
    }

    pub fn remove(&mut self, image: &Arc<Image>) -> Option<Arc<Image>> {
        let at = self.images.iter().position(|i| Arc::ptr_eq(i, image))?;
        Some(self.images.remove(at))
    }

    pub fn remove_path(&mut self, path: &Path) -> Option<Arc<Image>> {
        let at = self.find(path)?;
        Some(self.images.remove(at))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Image>> {
        self.images.get(index)
    }

    pub fn position(&self, image: &Arc<Image>) -> Option<usize> {
        self.images.iter().position(|i| Arc::ptr_eq(i, image))
    }

    /// Index of the image at `path`.
    pub fn find(&self, path: &Path) -> Option<usize> {
        self.images.iter().position(|i| i.path() == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Image>> {
        self.images.iter()
    }

    /// Restore the order after save-as renamed some entities.
    pub fn resort(&mut self) {
        self.images.sort_by_cached_key(|image| sort_key(image));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn captions(collection: &ImageCollection) -> Vec<String> {
        collection.iter().map(|i| i.caption()).collect()
    }

    #[test]
    fn test_sorted_case_insensitively() {
        let mut collection = ImageCollection::new();
        collection.add(Image::new("/p/b.png"));
        collection.add(Image::new("/p/C.png"));
        collection.add(Image::new("/p/a.png"));
        assert_eq!(captions(&collection), vec!["a.png", "b.png", "C.png"]);
    }

    #[test]
    fn test_duplicates_by_path_are_ignored() {
        let output = ModelOutput {
            images: vec![
                Image::new("/p/a.png"),
                Image::new("/p/a.png"),
                Image::new("/q/a.png"),
            ],
            errors: vec![PathBuf::from("/p/readme.txt")],
        };
        let collection = ImageCollection::from_model(output);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.get(0).unwrap().path(), PathBuf::from("/p/a.png"));
    }

    #[test]
    fn test_remove_drops_last_reference() {
        let mut collection = ImageCollection::new();
        let image = Image::new("/p/a.png");
        let weak = Arc::downgrade(&image);
        collection.add(image);
        assert!(collection.remove_path(Path::new("/p/a.png")).is_some());
        assert!(collection.is_empty());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_position_and_remove_by_entity() {
        let mut collection = ImageCollection::new();
        let a = Image::new("/p/a.png");
        let b = Image::new("/p/b.png");
        collection.extend([b.clone(), a.clone()]);
        assert_eq!(collection.position(&b), Some(1));
        assert!(collection.remove(&a).is_some());
        assert_eq!(collection.position(&b), Some(0));
        assert!(collection.remove(&a).is_none());
    }
}
