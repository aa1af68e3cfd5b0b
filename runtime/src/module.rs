use bitflags::bitflags;

use crate::ValueId;

bitflags! {
    /// Per-binding property flags. The byte layout matches the serialized
    /// flag byte: `deprecated<<3 | const<<2 | export<<1 | import`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindingFlags: u8 {
        const IMPORTED = 1 << 0;
        const EXPORTED = 1 << 1;
        const CONST = 1 << 2;
        const DEPRECATED = 1 << 3;
    }
}

/// A name slot in a module's binding table.
pub struct Binding {
    /// Symbol.
    pub name: ValueId,
    pub value: Option<ValueId>,
    pub globalref: Option<ValueId>,
    /// The module this binding was imported from; the owning module itself
    /// for original bindings.
    pub owner: Option<ValueId>,
    /// Declared type constraint, if any.
    pub ty: Option<ValueId>,
    pub flags: BindingFlags,
}

impl Binding {
    #[inline(always)]
    pub fn is_const(&self) -> bool {
        self.flags.contains(BindingFlags::CONST)
    }

    #[inline(always)]
    pub fn is_exported(&self) -> bool {
        self.flags.contains(BindingFlags::EXPORTED)
    }
}

/// Module UUID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uuid {
    pub hi: u64,
    pub lo: u64,
}

/// A module: a named binding table plus identity and behavior knobs.
///
/// A module is *internal* to a cache exactly when it is in, or under, the
/// worklist being saved.
pub struct Module {
    /// Symbol.
    pub name: ValueId,
    /// The enclosing module; a top-level module is its own parent.
    pub parent: Option<ValueId>,
    /// Binding table in insertion order. Linear lookup; tables are small
    /// and insertion order must be stable for the codec.
    pub bindings: Vec<(ValueId, Binding)>,
    /// Modules imported via `using`.
    pub usings: Vec<ValueId>,
    pub uuid: Uuid,
    pub build_id: u64,
    pub is_top_mod: bool,
    pub counter: i32,
    pub nospecialize: i32,
    pub optlevel: u8,
    pub compile: u8,
    pub infer: u8,
    pub max_methods: u8,
    /// World in which this module became visible.
    pub primary_world: u64,
}

impl Module {
    pub fn new(name: ValueId, build_id: u64) -> Self {
        Self {
            name,
            parent: None,
            bindings: Vec::new(),
            usings: Vec::new(),
            uuid: Uuid::default(),
            build_id,
            is_top_mod: false,
            counter: 0,
            nospecialize: 0,
            optlevel: 0,
            compile: 0,
            infer: 0,
            max_methods: 0,
            primary_world: 0,
        }
    }

    pub fn binding(&self, name: ValueId) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|(sym, _)| *sym == name)
            .map(|(_, b)| b)
    }

    pub fn binding_mut(&mut self, name: ValueId) -> Option<&mut Binding> {
        self.bindings
            .iter_mut()
            .find(|(sym, _)| *sym == name)
            .map(|(_, b)| b)
    }

    /// Get-or-create a writable binding owned by this module.
    pub fn binding_wr(&mut self, name: ValueId, self_id: ValueId) -> &mut Binding {
        if let Some(i) = self.bindings.iter().position(|(sym, _)| *sym == name) {
            return &mut self.bindings[i].1;
        }
        self.bindings.push((
            name,
            Binding {
                name,
                value: None,
                globalref: None,
                owner: Some(self_id),
                ty: None,
                flags: BindingFlags::empty(),
            },
        ));
        &mut self.bindings.last_mut().unwrap().1
    }
}
