//! Foster-child splits and adoption.
//!
//! A split installs a transient right sibling (the foster child) that
//! the parent has not yet adopted. While it exists, the page's key range
//! is split at the foster fence and readers with the right slice chase
//! the foster pointer. The next descending traversal adopts the foster
//! into the parent's minipage, or foster-splits the parent itself when
//! the minipage is full; at the root, growth installs a new intermediate
//! root instead.
//!
//! Lock ordering: a split locks only the splitting page plus the fresh
//! (unpublished) sibling; adoption locks the parent's minipage first and
//! the child only to clear its foster link.

use crate::error::{EngineResult, ErrorCode};
use crate::key::KeySlice;
use crate::page::VolatilePointer;
use crate::thread::ThreadContext;
use crate::version::{VersionGuard, VersionSnapshot, LOCKED_BIT};

use super::border::{BorderPage, BORDER_MAX_KEYS};
use super::intermediate::{IntermediatePage, MINI_SEPARATORS};
use super::MasstreePage;

/// Pick the foster fence for a border split: the median of the live
/// slices, or the inserting slice when it extends the range upward.
fn choose_foster_fence(
    live_slices: &[KeySlice],
    low_fence: KeySlice,
    trigger: KeySlice,
) -> Option<KeySlice> {
    match live_slices.last() {
        None => {
            // Every slot migrated away in earlier splits; route the new
            // key to a fresh foster page.
            (trigger > low_fence).then_some(trigger)
        }
        Some(&max) if trigger > max => Some(trigger),
        Some(_) => {
            let median = live_slices[live_slices.len() / 2];
            if median > low_fence {
                Some(median)
            } else {
                live_slices.iter().copied().find(|&s| s > low_fence)
            }
        }
    }
}

/// Split a border page, installing a foster child that takes the slots
/// at and above the chosen fence.
///
/// The caller holds the page lock via `guard`. Returns the foster page
/// still locked; the caller inserts into whichever side the trigger
/// slice routes to and then releases both.
pub(super) fn split_foster_border<'a>(
    context: &ThreadContext,
    page: &'a BorderPage,
    guard: &mut VersionGuard<'_>,
    trigger: KeySlice,
) -> EngineResult<(&'a BorderPage, VersionGuard<'a>)> {
    debug_assert!(guard.locks(page.common().version()));
    debug_assert!(!guard.snapshot().has_foster_child());
    let count = guard.snapshot().key_count();
    debug_assert!(count > 0);

    // Live slices only: slots migrated by earlier splits stay behind as
    // tombstones until the page is reclaimed.
    let mut live: Vec<KeySlice> = (0..count)
        .filter(|&i| !page.owner_id(i).load().is_moved())
        .map(|i| page.slice(i))
        .collect();
    live.sort_unstable();
    live.dedup();
    let fence = choose_foster_fence(&live, page.common().low_fence(), trigger).ok_or_else(
        || ErrorCode::Internal("foster split: no fence above low_fence".to_string()),
    )?;

    let grabbed = context.grab_free_page()?;
    let foster_pointer = grabbed.without_flags();
    let foster_raw = context.resolve(grabbed).cast::<BorderPage>();
    let old_supremum = guard.snapshot().is_high_fence_supremum();
    // SAFETY: freshly grabbed, unpublished page slot.
    unsafe {
        BorderPage::initialize(
            foster_raw,
            page.common().storage_id(),
            foster_pointer,
            page.layer(),
            false,
            fence,
            page.common().high_fence(),
            old_supremum,
        );
    }
    // SAFETY: initialized just above, still private to this thread.
    let foster: &BorderPage = unsafe { &*foster_raw };
    let mut foster_guard = foster.common().version().lock();

    // Fence off concurrent readers before touching any slot.
    guard.mark_splitting();

    let mut migrated = 0usize;
    for index in 0..count {
        if page.slice(index) < fence {
            continue;
        }
        // Freeze the record, move it, and leave the moved mark behind.
        let observed = page.owner_id(index).lock_unconditional();
        if observed.is_moved() {
            page.owner_id(index).release_lock();
            continue;
        }
        foster.migrate_slot(
            &mut foster_guard,
            migrated,
            page,
            index,
            observed.without_lock(),
        );
        migrated += 1;
        page.owner_id(index)
            .publish(observed.without_lock().with_moved());
    }
    debug_assert!(migrated <= BORDER_MAX_KEYS);
    foster_guard.set_key_count(migrated);

    page.common().set_foster(fence, foster_pointer);
    guard.set_has_foster_child();
    tracing::debug!(
        storage_id = page.common().storage_id(),
        layer = page.layer(),
        migrated,
        "border page split"
    );
    Ok((foster, foster_guard))
}

/// Foster-split an intermediate page: the right half of the flattened
/// (separator, pointer) entries moves to a new sibling and both halves
/// are repacked into half-full minipages.
pub(super) fn split_foster_intermediate(
    context: &ThreadContext,
    page: &IntermediatePage,
) -> EngineResult<()> {
    let mut guard = page.common().version().lock();
    if guard.snapshot().has_foster_child() {
        // Already split; the grandparent adopts before this page splits
        // again.
        return Ok(());
    }
    let outer_count = guard.snapshot().key_count();

    // Freeze every in-use minipage so the flattened view is consistent.
    let mut mini_guards: Vec<VersionGuard<'_>> = Vec::with_capacity(outer_count + 1);
    for mini_index in 0..=outer_count {
        mini_guards.push(page.minipage(mini_index).version().lock());
    }
    let mini_counts: Vec<usize> = mini_guards
        .iter()
        .map(|g| g.snapshot().key_count())
        .collect();

    // Fence off concurrent readers before rebuilding minipages.
    guard.mark_splitting();
    for mini_guard in &mut mini_guards {
        mini_guard.mark_splitting();
    }

    let (pointers, separators) = page.flatten(outer_count, &mini_counts);
    debug_assert!(pointers.len() >= 2);
    let mid = pointers.len() / 2;
    let fence = separators[mid - 1];

    let grabbed = context.grab_free_page()?;
    let foster_pointer = grabbed.without_flags();
    let foster_raw = context.resolve(grabbed).cast::<IntermediatePage>();
    let old_supremum = guard.snapshot().is_high_fence_supremum();
    // SAFETY: freshly grabbed, unpublished page slot.
    unsafe {
        IntermediatePage::initialize(
            foster_raw,
            page.common().storage_id(),
            foster_pointer,
            page.common().layer(),
            false,
            fence,
            page.common().high_fence(),
            old_supremum,
        );
    }
    // SAFETY: initialized just above, still private to this thread.
    let foster = unsafe { &*foster_raw };
    let foster_outer = foster.repack(&pointers[mid..], &separators[mid..]);
    {
        let mut foster_guard = foster.common().version().lock();
        foster_guard.set_key_count(foster_outer);
    }

    // Rebuild the left half in place. Readers that race the rebuild see
    // the splitting bit and retry from the layer root.
    let left_outer = page.repack(&pointers[..mid], &separators[..mid - 1]);
    guard.set_key_count(left_outer);
    // Minipages beyond the repacked set stay masked by the outer key
    // count; unlock them with a cleared count.
    for mini_index in (left_outer + 1)..=outer_count {
        page.minipage(mini_index).version().reset_with_key_count(0);
    }
    // repack() rewrote the rebuilt minipages' version words (unlocked,
    // fresh counts). Forgetting the guards keeps their Drop from
    // clobbering that state; the page-level splitting bit fences racing
    // readers out until the page guard itself drops.
    mini_guards.into_iter().for_each(std::mem::forget);

    page.common().set_foster(fence, foster_pointer);
    guard.set_has_foster_child();
    tracing::debug!(
        storage_id = page.common().storage_id(),
        layer = page.common().layer(),
        entries = pointers.len(),
        "intermediate page split"
    );
    Ok(())
}

/// Adopt a child's foster into the parent's minipage.
///
/// Idempotent-safe: a concurrent adopter's action is detected by version
/// change and the loser simply returns for the caller to re-descend.
#[allow(clippy::too_many_arguments)]
pub(super) fn adopt_from_child(
    context: &ThreadContext,
    parent: &IntermediatePage,
    parent_stable: VersionSnapshot,
    minipage_index: usize,
    mini_stable: VersionSnapshot,
    pointer_index: usize,
    child: &MasstreePage,
) -> EngineResult<()> {
    let mini = parent.minipage(minipage_index);
    let mut mini_guard = mini.version().lock();

    // Verify both versions under the lock; a change means our routing
    // decision is stale and the caller retries.
    if (parent.common().version().observe().word() ^ parent_stable.word()) > LOCKED_BIT
        || (mini_guard.snapshot().word() ^ mini_stable.word()) > LOCKED_BIT
    {
        return Ok(());
    }

    if mini_guard.snapshot().key_count() >= MINI_SEPARATORS {
        // No room in the minipage: the intermediate page itself splits
        // via foster, and the caller restarts from the layer root.
        drop(mini_guard);
        return split_foster_intermediate(context, parent);
    }

    let mut child_guard = child.version().lock();
    if !child_guard.snapshot().has_foster_child() {
        // Someone else already adopted it.
        return Ok(());
    }
    let fence = child.foster_fence();
    let foster = child.foster_child_pointer();
    debug_assert!(!foster.is_null());
    debug_assert!({
        let adopted: VolatilePointer = mini.pointer(pointer_index).volatile_pointer();
        adopted.offset() == child.self_pointer().offset()
    });

    mini.insert_separator(&mut mini_guard, pointer_index, fence, foster.without_flags());

    // Clear the child's foster link; its fence range collapses.
    child_guard.mark_splitting();
    child.collapse_foster(&mut child_guard);
    tracing::trace!(
        storage_id = parent.common().storage_id(),
        layer = child.layer(),
        "adopted foster child"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_fence_median() {
        let live = vec![10, 20, 30, 40];
        // A trigger inside the range splits at the median.
        assert_eq!(choose_foster_fence(&live, 0, 35), Some(30));
        assert_eq!(choose_foster_fence(&live, 0, 15), Some(30));
        // A trigger beyond the range extends it.
        assert_eq!(choose_foster_fence(&live, 0, 100), Some(100));
    }

    #[test]
    fn test_choose_fence_degenerate() {
        // Everything migrated away: only the trigger remains.
        assert_eq!(choose_foster_fence(&[], 5, 9), Some(9));
        assert_eq!(choose_foster_fence(&[], 5, 5), None);
        // Trigger at the low fence falls back to a slice above it.
        assert_eq!(choose_foster_fence(&[5, 8], 5, 5), Some(8));
    }
}
