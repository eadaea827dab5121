//! Lock-free descent with hand-over-hand version verification.
//!
//! A reader captures a page's stable version, reads a child pointer,
//! captures the child's stable version, then re-reads the parent. If
//! anything above the lock bit changed, the reader retries; if the split
//! counter changed, it restarts from the layer root. Children found
//! carrying a foster child are adopted into the parent on the way down,
//! and a layer root carrying one triggers tree growth instead.

use crate::error::{EngineResult, ErrorCode};
use crate::key::{KeySlice, INFIMUM_SLICE, SUPREMUM_SLICE};
use crate::page::{DualPointer, VolatilePointer, VOLATILE_FLAG_SWAPPABLE};
use crate::thread::ThreadContext;
use crate::version::{VersionSnapshot, LOCKED_BIT};

use super::border::BorderPage;
use super::intermediate::IntermediatePage;
use super::split::adopt_from_child;
use super::{as_border, as_intermediate, as_masstree_page, MasstreePage, MasstreeStorage};

impl MasstreeStorage {
    /// Load the first-layer root, growing the tree when the root carries
    /// a foster child, and record the observation in the pointer set.
    pub(super) fn get_first_root(&self, context: &mut ThreadContext) -> EngineResult<*mut u8> {
        loop {
            let pointer = self.first_root().volatile_pointer();
            debug_assert!(!pointer.is_null());
            let page_raw = context.resolve(pointer);
            // SAFETY: the root pointer always references a live page.
            let page = unsafe { as_masstree_page(page_raw) };
            let stable = page.version().stable();

            // Root page has a foster child: time for tree growth.
            if stable.has_foster_child() {
                match self.grow_root(context, self.first_root(), page) {
                    Ok(()) | Err(ErrorCode::Retry) => continue,
                    Err(e) => return Err(e),
                }
            }

            // The root pointer might be swapped, so track it.
            context
                .xct_mut()
                .add_to_pointer_set(self.first_root().volatile_cell(), pointer.word());
            return Ok(page_raw);
        }
    }

    /// Follow a next-layer pointer, growing that layer's root if needed.
    pub(super) fn follow_layer(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
    ) -> EngineResult<*mut u8> {
        debug_assert!(border.does_point_to_layer(index));
        loop {
            let pointer: &DualPointer = border.next_layer_pointer(index);
            let volatile = pointer.volatile_pointer();
            if volatile.is_null() {
                return Err(ErrorCode::Retry);
            }
            // A layer root pointer may be swapped by growth.
            context
                .xct_mut()
                .add_to_pointer_set(pointer.volatile_cell(), volatile.word());
            let next_raw = context.resolve(volatile);
            // SAFETY: non-null layer pointers reference live pages.
            let next = unsafe { as_masstree_page(next_raw) };
            if next.version().stable().has_foster_child() {
                match self.grow_root(context, pointer, next) {
                    Ok(()) | Err(ErrorCode::Retry) => continue,
                    Err(e) => return Err(e),
                }
            }
            return Ok(next_raw);
        }
    }

    /// Grow a layer whose root carries a foster child: install a new
    /// intermediate root over {old root, foster child} and swap the
    /// (swappable) root pointer.
    pub(super) fn grow_root(
        &self,
        context: &mut ThreadContext,
        root_pointer: &DualPointer,
        root: &MasstreePage,
    ) -> EngineResult<()> {
        if root.layer() == 0 {
            tracing::info!(storage = %self.name(), "growing first-layer tree");
        } else {
            tracing::trace!(storage = %self.name(), layer = root.layer(), "growing layer tree");
        }
        let mut guard = root.version().lock();
        if !guard.snapshot().has_foster_child() {
            // Someone else has already grown this layer.
            tracing::debug!("concurrent thread already grew this layer");
            return Err(ErrorCode::Retry);
        }

        let grabbed = context.grab_free_page()?;
        let old_pointer = root_pointer.volatile_pointer();
        let new_pointer = VolatilePointer::new(
            grabbed.node(),
            VOLATILE_FLAG_SWAPPABLE,
            old_pointer.mod_count().wrapping_add(1),
            grabbed.offset(),
        );
        let new_root_raw = context.resolve(grabbed).cast::<IntermediatePage>();
        // SAFETY: freshly grabbed, unpublished page slot.
        unsafe {
            IntermediatePage::initialize(
                new_root_raw,
                self.id(),
                new_pointer,
                root.layer(),
                true, // the new page is the layer root
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
            );
        }
        // SAFETY: initialized just above, still private to this thread.
        let new_root = unsafe { &*new_root_raw };
        let fence: KeySlice = root.foster_fence();
        let foster = root.foster_child_pointer();
        debug_assert!(!foster.is_null());
        new_root.repack(
            &[old_pointer.without_flags(), foster.without_flags()],
            &[fence],
        );

        // Retire the old root's foster link; its fence range collapses.
        guard.mark_splitting();
        guard.clear_root();
        root.collapse_foster(&mut guard);

        // Install the pointer to the new root page, and update our own
        // pointer-set entry to avoid self-abort.
        root_pointer.set_volatile(new_pointer);
        context
            .xct_mut()
            .overwrite_to_pointer_set(root_pointer.volatile_cell(), new_pointer.word());
        Ok(())
    }

    /// Descend from a layer root to the border page covering `slice`.
    ///
    /// Returns the border and the stable version under which its key
    /// count may be trusted. `Retry` means the layer root itself is
    /// stale and the caller must restart from `get_first_root`.
    pub(super) fn find_border<'a>(
        &self,
        context: &mut ThreadContext,
        layer_root: *mut u8,
        layer: u8,
        slice: KeySlice,
    ) -> EngineResult<(&'a BorderPage, VersionSnapshot)> {
        // SAFETY: layer roots reference live pages.
        let root = unsafe { as_masstree_page(layer_root) };
        'restart: loop {
            if !root.within_fences(slice) {
                // The root collapsed under a concurrent growth; the
                // caller re-reads the root pointer.
                return Err(ErrorCode::Retry);
            }
            let mut cur_raw = layer_root;
            let mut cur = root;
            let mut cur_stable = cur.version().stable();
            loop {
                debug_assert_eq!(cur.layer(), layer);

                // Chase the foster chain when the slice is delegated.
                if cur_stable.has_foster_child() && cur.within_foster_child(slice) {
                    let foster = cur.foster_child_pointer();
                    if foster.is_null() {
                        // Adoption retired the link under us.
                        let renewed = cur.version().stable();
                        if renewed.split_counter() != cur_stable.split_counter() {
                            continue 'restart;
                        }
                        cur_stable = renewed;
                        continue;
                    }
                    let next_raw = context.resolve(foster);
                    // SAFETY: a published foster pointer references a
                    // live, initialized page.
                    let next = unsafe { as_masstree_page(next_raw) };
                    let next_stable = next.version().stable();
                    // Hand-over-hand: re-check cur before moving over.
                    if (cur.version().observe().word() ^ cur_stable.word()) <= LOCKED_BIT {
                        cur_raw = next_raw;
                        cur = next;
                        cur_stable = next_stable;
                        continue;
                    }
                    let renewed = cur.version().stable();
                    if renewed.split_counter() != cur_stable.split_counter() {
                        continue 'restart;
                    }
                    cur_stable = renewed;
                    continue;
                }

                if cur_stable.is_border() {
                    // SAFETY: the border flag was checked.
                    return Ok((unsafe { as_border(cur_raw) }, cur_stable));
                }

                // SAFETY: not a border, so an intermediate page.
                let inter: &IntermediatePage = unsafe { as_intermediate(cur_raw) };
                let mini_index = inter.find_minipage(cur_stable.key_count(), slice);
                let mini = inter.minipage(mini_index);
                let mini_stable = mini.version().stable();
                let pointer_index = mini.find_pointer(mini_stable.key_count(), slice);
                let child_pointer = mini.pointer(pointer_index).volatile_pointer();
                if child_pointer.is_null() {
                    // Torn read during a concurrent rebuild.
                    let renewed = cur.version().stable();
                    if renewed.split_counter() != cur_stable.split_counter() {
                        continue 'restart;
                    }
                    cur_stable = renewed;
                    continue;
                }
                let child_raw = context.resolve(child_pointer);
                // SAFETY: non-null child pointers reference live pages.
                let child = unsafe { as_masstree_page(child_raw) };

                if child.version().observe().has_foster_child() {
                    // The child has a foster child: adopt it into this
                    // page before continuing.
                    adopt_from_child(
                        context,
                        inter,
                        cur_stable,
                        mini_index,
                        mini_stable,
                        pointer_index,
                        child,
                    )?;
                    let renewed = cur.version().stable();
                    if renewed.split_counter() != cur_stable.split_counter() {
                        continue 'restart;
                    }
                    cur_stable = renewed;
                    continue;
                }

                let child_stable = child.version().stable();
                // Hand-over-hand: verify this page and its minipage.
                let diff = cur.version().observe().word() ^ cur_stable.word();
                let diff_mini = mini.version().observe().word() ^ mini_stable.word();
                if diff <= LOCKED_BIT && diff_mini <= LOCKED_BIT {
                    cur_raw = child_raw;
                    cur = child;
                    cur_stable = child_stable;
                    continue;
                }
                tracing::trace!("descent observed a changed version; retrying");
                let renewed = cur.version().stable();
                if renewed.split_counter() != cur_stable.split_counter() {
                    continue 'restart;
                }
                cur_stable = renewed;
            }
        }
    }
}
