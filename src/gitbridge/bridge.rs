//! Read-only bridge between git smart-HTTP and the versioned store.
//!
//! Git objects are synthesized in memory from the listed tree: small files
//! become real blobs, LFS-classified files become pointer blobs, and
//! `.gitattributes`/`.lfsconfig` are passed through or injected so a plain
//! `git clone` + `git lfs pull` works against this service.

use std::collections::HashMap;

use futures::future::join_all;
use glob::Pattern;
use tracing::{info, warn};

use super::objects::{
    GitObject, build_nested_trees, create_blob_object, create_commit_object, create_empty_pack,
    create_lfs_pointer, create_pack_file,
};
use crate::config::AppConfig;
use crate::error::Result;
use crate::lakefs::{LakefsClient, ObjectStat};
use crate::rules::should_use_lfs;
use crate::store::Store;
use crate::types::Repository;

const FILE_MODE: &str = "100644";

pub struct GitBridge<'a> {
    pub store: &'a dyn Store,
    pub lakefs: &'a LakefsClient,
    pub app: &'a AppConfig,
    pub repo: &'a Repository,
    pub lakefs_repo: String,
}

struct BlobSet {
    /// (mode, path, sha1) entries for tree construction.
    entries: Vec<(String, String, String)>,
    blobs: Vec<GitObject>,
}

fn generate_lfsconfig(base_url: &str, full_id: &str) -> Vec<u8> {
    format!("[lfs]\n\turl = {base_url}/{full_id}.git/info/lfs\n").into_bytes()
}

fn generate_gitattributes(lfs_paths: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for path in {
        let mut sorted = lfs_paths.to_vec();
        sorted.sort();
        sorted
    } {
        out.push_str(&format!("{path} filter=lfs diff=lfs merge=lfs -text\n"));
    }
    out.into_bytes()
}

fn parse_lfs_patterns(content: &str) -> Vec<Pattern> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && line.contains("filter=lfs"))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|raw| Pattern::new(raw).ok())
        .collect()
}

fn matches_lfs_pattern(path: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches(path)
            || path
                .rsplit('/')
                .next()
                .is_some_and(|base| pattern.matches(base))
    })
}

impl GitBridge<'_> {
    /// Advertised refs for the branch: the synthesized HEAD commit id.
    pub async fn get_refs(&self, branch: &str) -> Result<Vec<(String, String)>> {
        let Some((commit, _, _)) = self.build_objects(branch).await? else {
            return Ok(Vec::new());
        };
        Ok(vec![
            ("HEAD".to_string(), commit.sha1.clone()),
            (format!("refs/heads/{branch}"), commit.sha1),
        ])
    }

    /// Full pack for a clone of `branch`. `haves` are ignored: the bridge
    /// serves a single synthesized commit, so every fetch is a full fetch.
    pub async fn build_pack_file(&self, branch: &str) -> Result<Vec<u8>> {
        let Some((commit, trees, blobs)) = self.build_objects(branch).await? else {
            info!("No objects for {}/{branch}, returning empty pack", self.repo.full_id);
            return Ok(create_empty_pack());
        };

        let mut objects = Vec::with_capacity(1 + trees.len() + blobs.len());
        objects.push(commit);
        objects.extend(trees);
        objects.extend(blobs);

        let pack = create_pack_file(&objects);
        info!(
            "Built pack for {}/{branch}: {} object(s), {} bytes",
            self.repo.full_id,
            objects.len(),
            pack.len()
        );
        Ok(pack)
    }

    async fn build_objects(
        &self,
        branch: &str,
    ) -> Result<Option<(GitObject, Vec<GitObject>, Vec<GitObject>)>> {
        let file_objects = self.list_all_objects(branch).await?;
        if file_objects.is_empty() {
            return Ok(None);
        }

        let blob_set = self.build_blobs(branch, &file_objects).await?;
        if blob_set.entries.is_empty() {
            return Ok(None);
        }

        let (root_tree, trees) = build_nested_trees(&blob_set.entries);

        let branch_info = self.lakefs.get_branch(&self.lakefs_repo, branch).await?;
        let commit_info = self
            .lakefs
            .get_commit(&self.lakefs_repo, &branch_info.commit_id)
            .await?;

        let author = if commit_info.committer.is_empty() {
            self.repo.namespace.clone()
        } else {
            commit_info.committer.clone()
        };
        let commit = create_commit_object(
            &root_tree,
            &[],
            &author,
            "noreply@kohakuhub.local",
            commit_info.creation_date,
            &commit_info.message,
        );

        Ok(Some((commit, trees, blob_set.blobs)))
    }

    async fn list_all_objects(&self, branch: &str) -> Result<Vec<ObjectStat>> {
        let mut all = Vec::new();
        let mut after = String::new();
        loop {
            let listing = self
                .lakefs
                .list_objects(&self.lakefs_repo, branch, "", "", &after, 1000)
                .await?;
            all.extend(listing.results.into_iter().filter(ObjectStat::is_object));
            match listing.pagination {
                Some(p) if p.has_more => after = p.next_offset,
                _ => break,
            }
        }
        Ok(all)
    }

    async fn build_blobs(&self, branch: &str, file_objects: &[ObjectStat]) -> Result<BlobSet> {
        let file_records: HashMap<String, crate::types::File> = self
            .store
            .list_active_files(self.repo.id)?
            .into_iter()
            .map(|f| (f.path_in_repo.clone(), f))
            .collect();

        // A real .gitattributes wins over synthesis.
        let mut gitattributes_content: Option<Vec<u8>> = None;
        let mut lfs_patterns = Vec::new();
        if file_objects.iter().any(|o| o.path == ".gitattributes") {
            match self
                .lakefs
                .get_object(&self.lakefs_repo, branch, ".gitattributes")
                .await
            {
                Ok(bytes) => {
                    lfs_patterns = parse_lfs_patterns(&String::from_utf8_lossy(&bytes));
                    gitattributes_content = Some(bytes.to_vec());
                }
                Err(e) => warn!("Failed to read .gitattributes: {e}"),
            }
        }

        let mut small = Vec::new();
        let mut large = Vec::new();
        for obj in file_objects {
            if obj.path == ".gitattributes" {
                continue;
            }
            let record = file_records.get(&obj.path);
            let is_lfs = record.map(|f| f.lfs).unwrap_or(false)
                || should_use_lfs(self.repo, self.app, &obj.path, obj.size_bytes)
                || matches_lfs_pattern(&obj.path, &lfs_patterns);
            if is_lfs {
                large.push(obj);
            } else {
                small.push(obj);
            }
        }

        let small_blobs = join_all(small.iter().map(|obj| async {
            match self
                .lakefs
                .get_object(&self.lakefs_repo, branch, &obj.path)
                .await
            {
                Ok(bytes) => Some((obj.path.clone(), create_blob_object(&bytes))),
                Err(e) => {
                    warn!("Failed to download {}: {e}", obj.path);
                    None
                }
            }
        }))
        .await;

        let large_blobs = join_all(large.iter().map(|obj| async {
            let (sha256, size) = match file_records.get(&obj.path) {
                Some(f) if f.lfs => (f.sha256.clone(), f.size),
                _ => (obj.checksum_hex().to_string(), obj.size_bytes),
            };
            if sha256.is_empty() {
                warn!("No oid for LFS path {}, skipping", obj.path);
                return None;
            }
            Some((obj.path.clone(), create_blob_object(&create_lfs_pointer(&sha256, size))))
        }))
        .await;

        let mut entries = Vec::new();
        let mut blobs = Vec::new();
        let mut lfs_paths = Vec::new();

        for (path, blob) in small_blobs.into_iter().flatten() {
            entries.push((FILE_MODE.to_string(), path, blob.sha1.clone()));
            blobs.push(blob);
        }
        for (path, blob) in large_blobs.into_iter().flatten() {
            entries.push((FILE_MODE.to_string(), path.clone(), blob.sha1.clone()));
            blobs.push(blob);
            lfs_paths.push(path);
        }

        let gitattributes = match gitattributes_content {
            Some(content) => Some(content),
            None if !lfs_paths.is_empty() => Some(generate_gitattributes(&lfs_paths)),
            None => None,
        };
        if let Some(content) = gitattributes {
            let blob = create_blob_object(&content);
            entries.push((FILE_MODE.to_string(), ".gitattributes".to_string(), blob.sha1.clone()));
            blobs.push(blob);
        }

        if !lfs_paths.is_empty() {
            let blob = create_blob_object(&generate_lfsconfig(
                &self.app.base_url,
                &self.repo.full_id,
            ));
            entries.push((FILE_MODE.to_string(), ".lfsconfig".to_string(), blob.sha1.clone()));
            blobs.push(blob);
        }

        Ok(BlobSet { entries, blobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lfsconfig_points_at_this_service() {
        let config = String::from_utf8(generate_lfsconfig("https://hub.example.org", "alice/m1"))
            .unwrap();
        assert_eq!(
            config,
            "[lfs]\n\turl = https://hub.example.org/alice/m1.git/info/lfs\n"
        );
    }

    #[test]
    fn gitattributes_lists_each_lfs_path() {
        let content = String::from_utf8(generate_gitattributes(&[
            "b/weights.bin".to_string(),
            "a.bin".to_string(),
        ]))
        .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "a.bin filter=lfs diff=lfs merge=lfs -text",
                "b/weights.bin filter=lfs diff=lfs merge=lfs -text",
            ]
        );
    }

    #[test]
    fn parses_lfs_patterns_ignoring_comments() {
        let patterns = parse_lfs_patterns(
            "# comment\n*.bin filter=lfs diff=lfs merge=lfs -text\n*.txt text\n",
        );
        assert_eq!(patterns.len(), 1);
        assert!(matches_lfs_pattern("model.bin", &patterns));
        assert!(matches_lfs_pattern("deep/dir/model.bin", &patterns));
        assert!(!matches_lfs_pattern("readme.txt", &patterns));
    }
}
