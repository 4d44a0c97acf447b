//! Component H: the subscription table.
//!
//! A variable-length array of subscription records lives per module,
//! addressed the same way a module's dependency edges are: offset plus
//! length on the [`crate::index::ModuleRecord`]. Adding a subscription
//! extends the table by one record in place when it is already the
//! segment's tail-most allocation, and only relocates the whole table to a
//! fresh tail block when something else has been allocated after it.
//! Removal is cheaper: a swap-remove in place (no relocation), and if the
//! table happened to be the last thing allocated, the freed tail bytes are
//! reclaimed via [`crate::segment::Segment::shrink_to`].
//!
//! Subscriptions are identified by a per-module monotonic id rather than by
//! array offset, since the array's offset changes every time it relocates.

use bitflags::bitflags;

use crate::error::{StoreError, StoreResult};
use crate::index::ModuleIndex;
use crate::segment::Offset;

bitflags! {
    /// Which commit-pipeline events a subscription wants delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubscriptionEvents: u32 {
        /// Deliver the pre-commit update event (may supply its own edits).
        const UPDATE = 0b0001;
        /// Deliver the pre-store change event (may veto the commit).
        const CHANGE = 0b0010;
        /// Deliver the post-store done event.
        const DONE = 0b0100;
        /// Deliver the abort event when a later-priority subscriber vetoes.
        const ABORT = 0b1000;
    }
}

/// A single subscriber's registration on one module, addressed by [`id`]
/// rather than by its (relocatable) array position.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SubscriptionRecord {
    id: u64,
    priority: u32,
    events: u32,
    pid: u32,
    _pad: u32,
    /// Offset of the subscription's XPath filter string, or 0 for whole-module.
    xpath_off: u64,
}

impl SubscriptionRecord {
    /// Stable identifier, unique within the owning module's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Priority: higher runs first on UPDATE/CHANGE, last on ABORT redelivery.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The event mask this subscription registered for.
    pub fn events(&self) -> SubscriptionEvents {
        SubscriptionEvents::from_bits_truncate(self.events)
    }

    /// PID of the subscribing process, for liveness checks.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Offset of the XPath filter string, if any.
    pub fn xpath_offset(&self) -> Option<Offset> {
        (self.xpath_off != 0).then_some(self.xpath_off)
    }
}

/// Register a new subscription on `module_off`. Extends the module's
/// subscription table in place by one record when it is still the
/// segment's tail-most allocation, otherwise relocates the whole table to a
/// fresh tail block. Returns the new subscription's id.
pub fn subscribe(
    index: &mut ModuleIndex,
    module_off: Offset,
    priority: u32,
    events: SubscriptionEvents,
    xpath: Option<&str>,
) -> StoreResult<u64> {
    let xpath_off = match xpath {
        Some(x) => index.segment_mut().alloc_cstr(x)?,
        None => 0,
    };

    let (old_off, old_len, id) = {
        let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
        let (off, len) = rec.subscriptions();
        (off, len, rec.alloc_sub_id())
    };

    let record = SubscriptionRecord {
        id,
        priority,
        events: events.bits(),
        pid: std::process::id(),
        _pad: 0,
        xpath_off,
    };

    let array_end = old_off + old_len * std::mem::size_of::<SubscriptionRecord>() as u64;
    let was_at_tail = old_len > 0 && array_end == index.segment().alloc_offset();

    let new_off = if was_at_tail {
        index.segment_mut().alloc_value(record)?;
        old_off
    } else if old_len == 0 {
        index.segment_mut().alloc_array(&[record])?
    } else {
        let mut items: Vec<SubscriptionRecord> = index.segment().get_array::<SubscriptionRecord>(old_off, old_len)?.to_vec();
        items.push(record);
        index.segment_mut().alloc_array(&items)?
    };

    let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
    rec.set_subscriptions(new_off, old_len + 1);

    tracing::debug!(module_offset = module_off, sub_id = id, priority, "subscription added");
    Ok(id)
}

/// Remove the subscription with `id` from `module_off`'s table via
/// swap-remove, reclaiming tail bytes if the table was the last allocation.
pub fn unsubscribe(index: &mut ModuleIndex, module_off: Offset, id: u64) -> StoreResult<()> {
    let (off, len) = {
        let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
        rec.subscriptions()
    };
    if len == 0 {
        return Err(StoreError::NotFound(format!("subscription {id} not found")));
    }

    let mut items: Vec<SubscriptionRecord> = index.segment().get_array::<SubscriptionRecord>(off, len)?.to_vec();
    let pos = items
        .iter()
        .position(|s| s.id == id)
        .ok_or_else(|| StoreError::NotFound(format!("subscription {id} not found")))?;
    items.swap_remove(pos);

    let array_end = off + len * std::mem::size_of::<SubscriptionRecord>() as u64;
    let was_at_tail = array_end == index.segment().alloc_offset();

    if items.is_empty() {
        let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
        rec.set_subscriptions(0, 0);
        if was_at_tail {
            index.segment_mut().shrink_to(off)?;
        }
        return Ok(());
    }

    // Rewrite the live prefix in place; the vacated slot is either reclaimed
    // below (table was the tail-most allocation) or left as unreachable dead
    // space, since a non-tail bump allocator never frees mid-segment bytes.
    let dst = index.segment_mut().get_array_mut::<SubscriptionRecord>(off, len)?;
    dst[..items.len()].copy_from_slice(&items);
    if was_at_tail {
        index.segment_mut().shrink_to(off + items.len() as u64 * std::mem::size_of::<SubscriptionRecord>() as u64)?;
    }
    let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
    rec.set_subscriptions(off, items.len() as u64);

    tracing::debug!(module_offset = module_off, sub_id = id, "subscription removed");
    Ok(())
}

/// Live subscriptions on `module_off`, in descending priority order.
pub fn list_by_priority_desc(index: &ModuleIndex, module_off: Offset) -> StoreResult<Vec<SubscriptionRecord>> {
    let (off, len) = {
        let rec: &crate::index::ModuleRecord = index.segment().get(module_off)?;
        rec.subscriptions()
    };
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut items = index.segment().get_array::<SubscriptionRecord>(off, len)?.to_vec();
    items.sort_by_key(|s| std::cmp::Reverse(s.priority));
    Ok(items)
}

/// Live subscriptions on `module_off`, in ascending priority order, used to
/// redeliver ABORT in the order opposite to CHANGE/UPDATE delivery.
pub fn list_by_priority_asc(index: &ModuleIndex, module_off: Offset) -> StoreResult<Vec<SubscriptionRecord>> {
    let mut items = list_by_priority_desc(index, module_off)?;
    items.reverse();
    Ok(items)
}
