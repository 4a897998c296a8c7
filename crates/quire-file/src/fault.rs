//! The memory-fault path: resolving a faulting page to cached data.

use crate::mapping::FileHandle;
use crate::read::{issue_readahead, obtain_uptodate_page};
use quire_cache::CachedPage;
use quire_error::{QuireError, Result};
use quire_types::PageIndex;
use std::sync::Arc;
use tracing::trace;

/// What the faulting access pattern looks like, from the mapping's advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessHint {
    #[default]
    Normal,
    /// Advised sequential: always read ahead of the fault.
    Sequential,
    /// Advised random: never speculate.
    Random,
}

/// Resolve a fault at `index` to an uptodate page.
///
/// A fault past end of file is [`QuireError::BusFault`], unless `foreign`
/// is set (the access is on behalf of another context, like a debugger or
/// core writer), in which case it reports `Ok(None)` so the walker can skip
/// the page instead of dying on it. The size is re-checked after the page
/// is obtained; a concurrent truncation turns an in-flight fault into the
/// same past-EOF outcome.
pub(crate) fn fault(
    handle: &FileHandle,
    index: PageIndex,
    hint: AccessHint,
    foreign: bool,
) -> Result<Option<Arc<CachedPage>>> {
    let file = handle.file();
    let space = file.space();
    let config = file.ra_config();

    let past_eof = |index: PageIndex| index.0 >= file.nr_pages();
    let eof_result = |foreign: bool| {
        if foreign {
            Ok(None)
        } else {
            Err(QuireError::BusFault)
        }
    };

    if past_eof(index) {
        return eof_result(foreign);
    }

    let cached = space.lookup(index).filter(|p| p.is_uptodate());
    match cached {
        Some(page) => {
            // A hit slowly pays down the miss count, so a burst of cold
            // faults long ago does not disable read-around forever.
            let mut ra = handle.ra().lock();
            ra.fault_misses = ra.fault_misses.saturating_sub(1);
            drop(ra);
            if past_eof(index) {
                return eof_result(foreign);
            }
            Ok(Some(page))
        }
        None => {
            let misses = {
                let mut ra = handle.ra().lock();
                ra.fault_misses = ra.fault_misses.saturating_add(1);
                ra.fault_misses
            };
            match hint {
                AccessHint::Sequential => {
                    issue_readahead(file, index, config.readaround_pages);
                }
                AccessHint::Normal if misses <= config.miss_limit => {
                    // Read the aligned block around the fault, not just
                    // ahead of it; neighbors on both sides come along.
                    let block = config.readaround_pages.max(1) as u64;
                    let start = PageIndex(index.0 & !(block - 1));
                    issue_readahead(file, start, config.readaround_pages);
                }
                _ => {
                    trace!(index = index.0, "fault with read-around disabled");
                }
            }
            let page = obtain_uptodate_page(file, index)?;
            if past_eof(index) {
                return eof_result(foreign);
            }
            Ok(Some(page))
        }
    }
}
