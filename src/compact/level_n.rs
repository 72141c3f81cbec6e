use crate::compact::{key_range, Compactor};
use crate::db::db_iter::{page_source, sorted_run_source};
use crate::manifest::{ManifestSnapshot, PageHandle};
use crate::Result;
use rand::Rng;
use std::sync::Arc;

/// Merge one page of `level` with the pages of `level + 1` it overlaps.
pub(super) fn compact(compactor: &Compactor, snapshot: &ManifestSnapshot, level: usize) -> Result<()> {
    debug_assert!(level >= 1 && level + 1 < snapshot.num_levels());
    let page = match random_handle(snapshot.pages_at_level(level)) {
        Some(page) => page,
        None => return Ok(()),
    };
    let next_pages = snapshot.overlapping_pages(level + 1, &page.first_key, &page.last_key);
    let (min_key, max_key) = match key_range(&next_pages) {
        Some((min_key, max_key)) => (
            min_key.min(page.first_key.clone()),
            max_key.max(page.last_key.clone()),
        ),
        None => (page.first_key.clone(), page.last_key.clone()),
    };
    debug!(
        "compact page {}-{} with {} pages of level {}",
        level,
        page.version,
        next_pages.len(),
        level + 1
    );

    let sources = vec![
        sorted_run_source(
            snapshot.root().to_path_buf(),
            next_pages.clone(),
            compactor.cache.clone(),
            None,
        ),
        page_source(snapshot, &page, &compactor.cache, None),
    ];
    let mut inputs = vec![page];
    inputs.extend(next_pages);
    compactor.merge(snapshot, level + 1, &inputs, sources, &min_key, &max_key)
}

fn random_handle(pages: &[Arc<PageHandle>]) -> Option<Arc<PageHandle>> {
    if pages.is_empty() {
        return None;
    }
    let i = rand::thread_rng().gen_range(0..pages.len());
    Some(pages[i].clone())
}
