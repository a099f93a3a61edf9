//! Walks an absolute path component-by-component through the inode
//! collection. See spec §4.5.
//!
//! Iterative by construction (never recurses on path depth), per the
//! redesign guidance in spec §9 ("the source's recursive path walk
//! should be iterative to avoid stack depth concerns on adversarial
//! paths").

use bson::oid::ObjectId;

use crate::error::{Error, Result};
use crate::inode::{Inode, InodeType};
use crate::store::StoreClient;

/// Split `path` into its non-empty components.
fn components(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').filter(|c| !c.is_empty()).collect()
}

/// The leaf (final) component of `path`, `""` for the root.
pub fn leaf_name(path: &str) -> &str {
    components(path).last().copied().unwrap_or("")
}

pub struct PathResolver<'a> {
    store: &'a StoreClient,
}

impl<'a> PathResolver<'a> {
    pub fn new(store: &'a StoreClient) -> Self {
        PathResolver { store }
    }

    /// Walk from the root to the directory that would contain `path`'s
    /// leaf component. Returns `None` for the root path itself (which has
    /// no containing directory) or when an intermediate component fails
    /// to resolve to a directory.
    pub fn last_directory_id(&self, path: &str) -> Result<Option<ObjectId>> {
        let comps = components(path);
        if comps.is_empty() {
            return Ok(None);
        }

        let root = self
            .store
            .find_inode(None, "", Some(InodeType::Directory))?
            .ok_or(Error::NotFound)?;
        let mut current = root.id;

        for comp in &comps[..comps.len() - 1] {
            match self.store.find_inode(Some(current), comp, Some(InodeType::Directory))? {
                Some(dir) => current = dir.id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Resolve `path` to its parent id and leaf filename. The root path
    /// resolves to `(None, "")`, matching the root document itself.
    pub fn split(&self, path: &str) -> Result<(Option<ObjectId>, String)> {
        if path == "/" {
            return Ok((None, String::new()));
        }
        let leaf = leaf_name(path).to_string();
        let parent_id = self.last_directory_id(path)?.ok_or(Error::NotFound)?;
        Ok((Some(parent_id), leaf))
    }

    /// Plain, unlocked lookup: resolve `path` to its inode. Most
    /// operations (`getattr`, `read`, `readdir`, ...) go through this.
    pub fn get_inode(&self, path: &str) -> Result<Inode> {
        let (parent_id, leaf) = self.split(path)?;
        self.store.find_inode(parent_id, &leaf, None)?.ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_ignore_empty_segments() {
        assert_eq!(components("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(components("/"), Vec::<&str>::new());
        assert_eq!(components("/a//b"), vec!["a", "b"]);
    }

    #[test]
    fn leaf_name_of_root_is_empty() {
        assert_eq!(leaf_name("/"), "");
        assert_eq!(leaf_name("/a/b"), "b");
    }
}
