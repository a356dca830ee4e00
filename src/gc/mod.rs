//! A three-region generational, moving garbage collector.
//!
//! Every heap object is addressed by a stable [`GcRef`] handle rather than
//! a raw pointer. A handle is an index into `Heap::table`, which maps it
//! to the object's *current* physical location (which region, which slot).
//! Moving an object during a collection means copying its storage and
//! rewriting exactly one `table` entry — no other object's fields ever
//! need to change, because nothing outside `Heap` ever stores a location,
//! only a `GcRef`. This is the arena-handle realization of the
//! forwarding-pointer/fixup-pass design: the fixup is centralized in the
//! table update that already happens as part of the copy.

pub mod objects;

use std::collections::{HashSet, VecDeque};

use crate::value::Value;
use objects::ObjData;

pub type ObjId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(pub ObjId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionTag {
    Nursery,
    AgingA,
    AgingB,
    OldA,
    OldB,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    tag: RegionTag,
    index: u32,
}

/// Per-object bookkeeping the collector needs. `marked` is used only by
/// the major (mark-compact) pass; `dirty` flags objects in an old
/// generation that may hold a reference into a younger one.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub marked: bool,
    pub dirty: bool,
    pub age: u8,
}

struct Object {
    id: ObjId,
    header: Header,
    data: ObjData,
}

/// Tuning knobs; defaults follow the sizes suggested by the design notes.
#[derive(Debug, Clone)]
pub struct Config {
    pub nursery_capacity: usize,
    pub aging_capacity: usize,
    pub promotion_age: u8,
    pub old_gen_initial_bytes: usize,
    pub old_gen_low_survival_growth: usize,
    pub old_gen_high_survival_growth: usize,
    pub old_gen_min_next_gc: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            nursery_capacity: 2 * 1024 * 1024 / 32,
            aging_capacity: 8 * 1024 * 1024 / 32,
            promotion_age: 2,
            old_gen_initial_bytes: 1024 * 1024,
            old_gen_low_survival_growth: 2,
            old_gen_high_survival_growth: 4,
            old_gen_min_next_gc: 1024 * 1024,
        }
    }
}

pub struct Heap {
    config: Config,
    nursery: Vec<Object>,
    aging: [Vec<Object>; 2],
    aging_active: usize,
    old: [Vec<Object>; 2],
    old_active: usize,
    table: Vec<Option<Location>>,
    free_ids: Vec<ObjId>,
    dirty: HashSet<ObjId>,
    intern: std::collections::HashMap<u64, Vec<GcRef>>,
    is_collecting: bool,
    next_gc: usize,
    old_gen_bytes_estimate: usize,
    pub minor_collections: u64,
    pub major_collections: u64,
}

impl Heap {
    pub fn new(config: Config) -> Heap {
        let next_gc = config.old_gen_initial_bytes;
        Heap {
            config,
            nursery: Vec::new(),
            aging: [Vec::new(), Vec::new()],
            aging_active: 0,
            old: [Vec::new(), Vec::new()],
            old_active: 0,
            table: Vec::new(),
            free_ids: Vec::new(),
            dirty: HashSet::new(),
            intern: std::collections::HashMap::new(),
            is_collecting: false,
            next_gc,
            old_gen_bytes_estimate: 0,
            minor_collections: 0,
            major_collections: 0,
        }
    }

    fn aging_from_tag(&self) -> RegionTag { if self.aging_active == 0 { RegionTag::AgingA } else { RegionTag::AgingB } }
    fn aging_to_tag(&self) -> RegionTag { if self.aging_active == 0 { RegionTag::AgingB } else { RegionTag::AgingA } }
    fn old_from_tag(&self) -> RegionTag { if self.old_active == 0 { RegionTag::OldA } else { RegionTag::OldB } }
    fn old_to_tag(&self) -> RegionTag { if self.old_active == 0 { RegionTag::OldB } else { RegionTag::OldA } }

    fn region(&self, tag: RegionTag) -> &Vec<Object> {
        match tag {
            RegionTag::Nursery => &self.nursery,
            RegionTag::AgingA => &self.aging[0],
            RegionTag::AgingB => &self.aging[1],
            RegionTag::OldA => &self.old[0],
            RegionTag::OldB => &self.old[1],
        }
    }

    fn region_mut(&mut self, tag: RegionTag) -> &mut Vec<Object> {
        match tag {
            RegionTag::Nursery => &mut self.nursery,
            RegionTag::AgingA => &mut self.aging[0],
            RegionTag::AgingB => &mut self.aging[1],
            RegionTag::OldA => &mut self.old[0],
            RegionTag::OldB => &mut self.old[1],
        }
    }

    fn alloc_id(&mut self) -> ObjId {
        if let Some(id) = self.free_ids.pop() {
            id
        } else {
            let id = self.table.len() as ObjId;
            self.table.push(None);
            id
        }
    }

    /// Allocates a fresh object into the nursery. Returns its stable handle.
    pub fn allocate(&mut self, data: ObjData) -> GcRef {
        let id = self.alloc_id();
        let index = self.nursery.len() as u32;
        self.nursery.push(Object { id, header: Header { marked: false, dirty: false, age: 0 }, data });
        self.table[id as usize] = Some(Location { tag: RegionTag::Nursery, index });
        GcRef(id)
    }

    pub fn nursery_len(&self) -> usize { self.nursery.len() }
    pub fn nursery_full(&self) -> bool { self.nursery.len() >= self.config.nursery_capacity }
    pub fn old_gen_over_threshold(&self) -> bool { self.old_gen_bytes_estimate >= self.next_gc }

    pub fn get(&self, r: GcRef) -> &ObjData {
        let loc = self.table[r.0 as usize].expect("dereferenced a freed GcRef");
        &self.region(loc.tag)[loc.index as usize].data
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut ObjData {
        let loc = self.table[r.0 as usize].expect("dereferenced a freed GcRef");
        &mut self.region_mut(loc.tag)[loc.index as usize].data
    }

    pub fn header(&self, r: GcRef) -> Header {
        let loc = self.table[r.0 as usize].expect("dereferenced a freed GcRef");
        self.region(loc.tag)[loc.index as usize].header
    }

    /// Call after storing `value` into a field of `container`. If
    /// `container` lives in an old generation and `value` points into a
    /// younger one, `container` is added to the remembered set so the
    /// next minor collection treats it as a root.
    pub fn write_barrier(&mut self, container: GcRef, value: Value) {
        let young = match value {
            Value::Obj(target) => self.is_young(target),
            _ => false,
        };
        if !young { return; }

        let loc = match self.table[container.0 as usize] {
            Some(l) => l,
            None => return,
        };
        let container_is_old = matches!(loc.tag, RegionTag::AgingB | RegionTag::OldA | RegionTag::OldB)
            && loc.tag != self.aging_from_tag();
        if container_is_old {
            self.dirty.insert(container.0);
            if let Some(obj) = self.region_mut(loc.tag).get_mut(loc.index as usize) {
                obj.header.dirty = true;
            }
        }
    }

    fn is_young(&self, r: GcRef) -> bool {
        match self.table[r.0 as usize] {
            Some(loc) => loc.tag == RegionTag::Nursery || loc.tag == self.aging_from_tag(),
            None => false,
        }
    }

    // ---- string interning ----

    pub fn intern_string(&mut self, s: &str, hash: u64) -> GcRef {
        if let Some(candidates) = self.intern.get(&hash) {
            for &candidate in candidates {
                if let ObjData::Str(existing, _) = self.get(candidate) {
                    if existing.as_ref() == s {
                        return candidate;
                    }
                }
            }
        }
        let r = self.allocate(ObjData::Str(s.to_string().into_boxed_str().into(), hash));
        self.intern.entry(hash).or_insert_with(Vec::new).push(r);
        r
    }

    // ---- collection ----

    /// Runs a minor (copying) collection: evacuates everything reachable
    /// from `roots` (plus the remembered set) out of the nursery and the
    /// current aging "from" space, promoting anything old enough.
    pub fn minor_collect(&mut self, roots: &[GcRef]) {
        self.is_collecting = true;
        self.minor_collections += 1;
        let mut grey: VecDeque<GcRef> = VecDeque::new();

        for &r in roots {
            self.evacuate_if_young(r, &mut grey);
        }

        let dirty_ids: Vec<ObjId> = self.dirty.iter().copied().collect();
        for id in dirty_ids {
            let r = GcRef(id);
            if self.table[id as usize].is_none() { self.dirty.remove(&id); continue; }
            for child in self.get(r).outgoing_refs() {
                self.evacuate_if_young(child, &mut grey);
            }
            self.clear_dirty(id);
        }

        while let Some(id) = grey.pop_front() {
            for child in self.get(id).outgoing_refs() {
                self.evacuate_if_young(child, &mut grey);
            }
        }

        // anything left in the nursery or aging-from is unreachable garbage
        for obj in self.nursery.drain(..) {
            self.free_ids.push(obj.id);
            self.table[obj.id as usize] = None;
        }
        let from_tag = self.aging_from_tag();
        for obj in self.region_mut(from_tag).drain(..) {
            self.free_ids.push(obj.id);
            self.table[obj.id as usize] = None;
        }
        self.aging_active = 1 - self.aging_active;

        self.is_collecting = false;
    }

    fn evacuate_if_young(&mut self, r: GcRef, grey: &mut VecDeque<GcRef>) {
        if !self.is_young(r) { return; }
        self.do_evacuate(r, grey);
    }

    fn do_evacuate(&mut self, r: GcRef, grey: &mut VecDeque<GcRef>) {
        let loc = match self.table[r.0 as usize] {
            Some(l) => l,
            None => return,
        };
        let src = self.region_mut(loc.tag);
        let mut obj = src.swap_remove(loc.index as usize);
        if (loc.index as usize) < src.len() {
            let moved_id = src[loc.index as usize].id;
            self.table[moved_id as usize] = Some(Location { tag: loc.tag, index: loc.index });
        }

        obj.header.age = obj.header.age.saturating_add(1);
        let promote = obj.header.age >= self.config.promotion_age;
        let dest_tag = if promote { self.old_to_tag() } else { self.aging_to_tag() };
        if promote {
            self.old_gen_bytes_estimate += obj.data.size_hint();
        }

        let dest = self.region_mut(dest_tag);
        let new_index = dest.len() as u32;
        dest.push(obj);
        self.table[r.0 as usize] = Some(Location { tag: dest_tag, index: new_index });
        grey.push_back(r);
    }

    fn clear_dirty(&mut self, id: ObjId) {
        self.dirty.remove(&id);
        if let Some(loc) = self.table[id as usize] {
            if let Some(obj) = self.region_mut(loc.tag).get_mut(loc.index as usize) {
                obj.header.dirty = false;
            }
        }
    }

    /// Runs a major (mark-compact) collection over the old generation.
    /// Young generations and the remembered set are scanned as
    /// additional roots so nothing only reachable from them is freed.
    pub fn major_collect(&mut self, roots: &[GcRef]) {
        self.is_collecting = true;
        self.major_collections += 1;

        for obj in self.nursery.iter_mut() { obj.header.marked = true; }
        for side in self.aging.iter_mut() { for obj in side.iter_mut() { obj.header.marked = true; } }
        for side in self.old.iter_mut() { for obj in side.iter_mut() { obj.header.marked = false; } }

        let mut grey: VecDeque<GcRef> = VecDeque::new();
        for &r in roots { self.mark(r, &mut grey); }
        for obj in self.nursery.iter() {
            for child in obj.data.outgoing_refs() { grey.push_back(child); }
        }
        for side in self.aging.iter() {
            for obj in side.iter() {
                for child in obj.data.outgoing_refs() { grey.push_back(child); }
            }
        }

        while let Some(r) = grey.pop_front() {
            self.mark(r, &mut grey);
        }

        self.sweep_intern_table();
        self.compact_old_gen();

        self.is_collecting = false;
    }

    fn mark(&mut self, r: GcRef, grey: &mut VecDeque<GcRef>) {
        let loc = match self.table[r.0 as usize] {
            Some(l) => l,
            None => return,
        };
        let already_marked = {
            let obj = &mut self.region_mut(loc.tag)[loc.index as usize];
            let was = obj.header.marked;
            obj.header.marked = true;
            was
        };
        if already_marked { return; }
        let children = self.get(r).outgoing_refs();
        for child in children { grey.push_back(child); }
    }

    fn sweep_intern_table(&mut self) {
        let table = &self.table;
        let old = &self.old;
        let is_live_string = |r: &GcRef| -> bool {
            match table[r.0 as usize] {
                Some(loc) => match loc.tag {
                    RegionTag::OldA => old[0][loc.index as usize].header.marked,
                    RegionTag::OldB => old[1][loc.index as usize].header.marked,
                    // young-generation strings are always kept alive by minor GC roots
                    RegionTag::Nursery | RegionTag::AgingA | RegionTag::AgingB => true,
                },
                None => false,
            }
        };
        for bucket in self.intern.values_mut() {
            bucket.retain(&is_live_string);
        }
        self.intern.retain(|_, bucket| !bucket.is_empty());
    }

    fn compact_old_gen(&mut self) {
        let from_tag = self.old_from_tag();
        let to_tag = self.old_to_tag();

        let mut estimate = 0usize;
        let mut survivors: Vec<Object> = Vec::new();
        for obj in self.region_mut(from_tag).drain(..) {
            if obj.header.marked {
                survivors.push(obj);
            } else {
                self.free_ids.push(obj.id);
                self.table[obj.id as usize] = None;
            }
        }

        let dest = self.region_mut(to_tag);
        dest.clear();
        for mut obj in survivors {
            obj.header.marked = false;
            estimate += obj.data.size_hint();
            let new_index = dest.len() as u32;
            self.table[obj.id as usize] = Some(Location { tag: to_tag, index: new_index });
            dest.push(obj);
        }
        self.old_gen_bytes_estimate = estimate;

        self.old_active = 1 - self.old_active;
        let survival_ratio_low = estimate < self.next_gc / 2;
        let growth = if survival_ratio_low { self.config.old_gen_low_survival_growth } else { self.config.old_gen_high_survival_growth };
        self.next_gc = (estimate * growth).max(self.config.old_gen_min_next_gc);
    }

    pub fn is_collecting(&self) -> bool { self.is_collecting }
}
