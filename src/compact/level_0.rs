use crate::compact::{key_range, Compactor};
use crate::db::db_iter::{page_source, sorted_run_source};
use crate::manifest::ManifestSnapshot;
use crate::Result;

/// Merge all the level 0 pages of `snapshot` and the level 1 pages they overlap
/// into new level 1 pages.
pub(super) fn compact(compactor: &Compactor, snapshot: &ManifestSnapshot) -> Result<()> {
    let level0_pages = snapshot.pages_at_level(0).to_vec();
    let (min_key, max_key) = match key_range(&level0_pages) {
        Some(range) => range,
        None => return Ok(()),
    };
    let level1_pages = snapshot.overlapping_pages(1, &min_key, &max_key);
    let (min_key, max_key) = match key_range(&level1_pages) {
        Some((min1, max1)) => (min_key.min(min1), max_key.max(max1)),
        None => (min_key, max_key),
    };
    debug!(
        "compact {} level 0 pages with {} level 1 pages",
        level0_pages.len(),
        level1_pages.len()
    );

    let mut sources = Vec::with_capacity(level0_pages.len() + 1);
    sources.push(sorted_run_source(
        snapshot.root().to_path_buf(),
        level1_pages.clone(),
        compactor.cache.clone(),
        None,
    ));
    // level 0 is newest first; sources go oldest first
    for page in level0_pages.iter().rev() {
        sources.push(page_source(snapshot, page, &compactor.cache, None));
    }

    let mut inputs = level0_pages;
    inputs.extend(level1_pages);
    compactor.merge(snapshot, 1, &inputs, sources, &min_key, &max_key)
}
