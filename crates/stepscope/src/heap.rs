//! Arena for guest values that carry identity.
//!
//! Objects are addressed by [`ObjId`] and never move, so aliasing works
//! exactly as in the guest language: `b = a` copies an id, and a mutation
//! through either name is visible through both. Slots are never freed within
//! one execution; a trace runs for at most `MAX_STEPS` steps under an
//! allocation budget, and the whole arena is dropped when the trace is
//! returned.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    lower::Block,
    resource::{ResourceError, ResourceTracker},
    value::{Value, float_repr, str_repr},
};

/// Identity of a heap-allocated guest object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjId(u32);

impl ObjId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A user-defined function.
#[derive(Debug)]
pub(crate) struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    /// Default values for the trailing parameters, evaluated at `def` time.
    pub defaults: Vec<Value>,
    pub body: Rc<Block>,
    /// Line of the `def` statement, reported by `Call` events.
    pub def_line: u32,
}

/// A user-defined class: a name, an optional base, and a namespace.
#[derive(Debug)]
pub(crate) struct ClassObj {
    pub name: String,
    pub base: Option<ObjId>,
    pub attrs: IndexMap<String, Value>,
}

/// An instance of a user-defined class.
#[derive(Debug)]
pub(crate) struct InstanceObj {
    pub class: ObjId,
    pub attrs: IndexMap<String, Value>,
}

/// Payload of one heap slot.
#[derive(Debug)]
pub(crate) enum ObjData {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(IndexMap<DictKey, Value>),
    Set(IndexMap<DictKey, Value>),
    Function(Rc<FunctionDef>),
    Class(ClassObj),
    Instance(InstanceObj),
}

impl ObjData {
    /// Approximate memory footprint, charged against the memory ceiling.
    fn estimate_size(&self) -> usize {
        match self {
            Self::List(items) | Self::Tuple(items) => 56 + items.len() * 16,
            Self::Dict(entries) => 64 + entries.len() * 48,
            Self::Set(entries) => 64 + entries.len() * 32,
            Self::Function(_) => 136,
            Self::Class(class) => 200 + class.attrs.len() * 48,
            Self::Instance(instance) => 56 + instance.attrs.len() * 48,
        }
    }
}

/// Hashable key for guest dicts and sets.
///
/// Floats are keyed by their bit pattern with `-0.0` folded into `0.0`;
/// numeric cross-type equality (`1 == 1.0` as dict keys) is not modeled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    /// Converts a value to a key, or reports the unhashable type's name.
    pub fn from_value(
        value: &Value,
        heap: &GuestHeap<impl ResourceTracker>,
    ) -> Result<Self, &'static str> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Float(f) => {
                let normalized = if *f == 0.0 { 0.0 } else { *f };
                Ok(Self::Float(normalized.to_bits()))
            }
            Value::Str(s) => Ok(Self::Str(s.to_string())),
            Value::Ref(id) => match heap.get(*id) {
                ObjData::Tuple(items) => {
                    let keys = items
                        .iter()
                        .map(|item| Self::from_value(item, heap))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Self::Tuple(keys))
                }
                ObjData::List(_) => Err("list"),
                ObjData::Dict(_) => Err("dict"),
                ObjData::Set(_) => Err("set"),
                _ => Err("object"),
            },
            _ => Err("object"),
        }
    }

    /// `str()` of the key, used when stringifying dict keys for snapshots.
    pub fn display(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(bits) => float_repr(f64::from_bits(*bits)),
            Self::Str(s) => s.clone(),
            Self::Tuple(keys) => {
                let parts: Vec<String> = keys.iter().map(Self::py_repr).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
        }
    }

    /// `repr()` of the key, used inside container reprs.
    pub fn py_repr(&self) -> String {
        match self {
            Self::Str(s) => str_repr(s),
            _ => self.display(),
        }
    }
}

/// The arena of guest objects, resource-tracked.
#[derive(Debug)]
pub(crate) struct GuestHeap<T: ResourceTracker> {
    slots: Vec<ObjData>,
    pub tracker: T,
}

impl<T: ResourceTracker> GuestHeap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            slots: Vec::new(),
            tracker,
        }
    }

    /// Allocates a slot, charging the resource tracker first.
    pub fn alloc(&mut self, data: ObjData) -> Result<ObjId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let id = ObjId(u32::try_from(self.slots.len()).expect("heap slot count exceeds u32"));
        self.slots.push(data);
        Ok(id)
    }

    pub fn get(&self, id: ObjId) -> &ObjData {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut ObjData {
        &mut self.slots[id.index()]
    }

    /// Best-effort size of one object, reported in heap snapshots.
    pub fn size_of(&self, id: ObjId) -> usize {
        self.get(id).estimate_size()
    }

    /// Display name of the class in the given slot.
    pub fn class_name(&self, class: ObjId) -> String {
        match self.get(class) {
            ObjData::Class(c) => c.name.clone(),
            _ => "object".to_owned(),
        }
    }

    /// Resolves an attribute through a class and its base chain.
    pub fn class_attr(&self, class: ObjId, name: &str) -> Option<Value> {
        let mut current = Some(class);
        while let Some(id) = current {
            let ObjData::Class(class) = self.get(id) else {
                return None;
            };
            if let Some(value) = class.attrs.get(name) {
                return Some(value.clone());
            }
            current = class.base;
        }
        None
    }

    /// True when `class` is `wanted` or inherits from it.
    pub fn is_subclass(&self, class: ObjId, wanted: ObjId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == wanted {
                return true;
            }
            let ObjData::Class(class) = self.get(id) else {
                return false;
            };
            current = class.base;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{LimitedTracker, NoLimitTracker, ResourceLimits};

    #[test]
    fn aliasing_is_identity() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let a = heap.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        let b = a; // `b = a` in the guest copies the id
        let ObjData::List(items) = heap.get_mut(b) else {
            unreachable!()
        };
        items.push(Value::Int(2));
        let ObjData::List(items) = heap.get(a) else { unreachable!() };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn allocation_budget_enforced() {
        let tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(1));
        let mut heap = GuestHeap::new(tracker);
        assert!(heap.alloc(ObjData::List(vec![])).is_ok());
        assert!(matches!(
            heap.alloc(ObjData::List(vec![])),
            Err(ResourceError::Allocation { .. })
        ));
    }

    #[test]
    fn dict_key_hashability() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        assert!(DictKey::from_value(&Value::Int(1), &heap).is_ok());
        assert!(DictKey::from_value(&Value::str("k"), &heap).is_ok());
        let tup = heap
            .alloc(ObjData::Tuple(vec![Value::Int(1), Value::str("x")]))
            .unwrap();
        assert!(DictKey::from_value(&Value::Ref(tup), &heap).is_ok());
        let list = heap.alloc(ObjData::List(vec![])).unwrap();
        assert_eq!(DictKey::from_value(&Value::Ref(list), &heap), Err("list"));
    }

    #[test]
    fn negative_zero_folds_into_zero() {
        let heap = GuestHeap::new(NoLimitTracker);
        let plus = DictKey::from_value(&Value::Float(0.0), &heap).unwrap();
        let minus = DictKey::from_value(&Value::Float(-0.0), &heap).unwrap();
        assert_eq!(plus, minus);
    }
}
