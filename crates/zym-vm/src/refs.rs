//! First-class references: dereference chains, construction-time
//! flattening, and the write-through assignment switch.

use std::rc::Rc;

use zym_gc::Handle;

use crate::error::RuntimeError;
use crate::value::{MapKey, Obj, RefKind, UpvalueState, Value};
use crate::Vm;

/// Bound on reference-chain traversal. Construction flattens chains, so
/// anything near this deep is a corrupted or adversarial chain.
pub(crate) const MAX_REF_HOPS: usize = 64;

impl Vm {
    /// True if `value` is a reference object (plain or native-backed).
    pub(crate) fn is_reference(&self, value: &Value) -> bool {
        if let Value::Obj(handle) = value {
            matches!(
                self.heap().get(*handle),
                Some(Obj::Reference(_)) | Some(Obj::NativeRef(_))
            )
        } else {
            false
        }
    }

    /// Follows `value` through reference objects until a concrete value
    /// remains. Non-references come back unchanged. Public so native
    /// functions can read through reference arguments.
    pub fn deref_value(&mut self, value: Value) -> Result<Value, RuntimeError> {
        let mut current = value;
        let mut visited: Vec<Handle> = Vec::new();
        loop {
            let Value::Obj(handle) = current else {
                return Ok(current);
            };
            let kind = match self.heap().get(handle) {
                Some(Obj::Reference(kind)) => Some(kind.clone()),
                Some(Obj::NativeRef(_)) => None,
                _ => return Ok(current),
            };
            if visited.contains(&handle) {
                return Err(RuntimeError::msg("circular reference chain"));
            }
            if visited.len() >= MAX_REF_HOPS {
                return Err(RuntimeError::msg("reference chain too long"));
            }
            visited.push(handle);
            current = match kind {
                Some(kind) => self.read_location(&kind)?,
                None => {
                    let handler = match self.heap().get(handle) {
                        Some(Obj::NativeRef(handler)) => Rc::clone(handler),
                        _ => unreachable!(),
                    };
                    handler.read(self)?
                }
            };
        }
    }

    /// Reads the value a reference target currently holds.
    pub(crate) fn read_location(&self, kind: &RefKind) -> Result<Value, RuntimeError> {
        match kind {
            RefKind::Local(slot) => self.stack.get(*slot).copied().ok_or_else(|| {
                RuntimeError::msg("dead reference: the referenced stack slot no longer exists")
            }),
            RefKind::Global(slot) => self.global_slot_value(*slot).ok_or_else(|| {
                RuntimeError::msg(format!(
                    "dead reference: global '{}' is not defined",
                    self.global_slot_name(*slot)
                ))
            }),
            RefKind::Upvalue(handle) => match self.heap().get(*handle) {
                Some(Obj::Upvalue(UpvalueState::Open(slot))) => {
                    self.stack.get(*slot).copied().ok_or_else(|| {
                        RuntimeError::msg(
                            "dead reference: the referenced stack slot no longer exists",
                        )
                    })
                }
                Some(Obj::Upvalue(UpvalueState::Closed(value))) => Ok(*value),
                _ => Err(RuntimeError::msg(
                    "dead reference: the referenced upvalue was collected",
                )),
            },
            RefKind::Index { container, index } => self.index_get_raw(container, index),
            RefKind::Property { container, key } => self.prop_get_raw(container, key),
        }
    }

    /// Builds a reference value. If the target currently holds another
    /// reference, the new reference is flattened to point at the end of
    /// that chain, so chains never grow by construction.
    pub(crate) fn make_reference(&mut self, kind: RefKind) -> Result<Value, RuntimeError> {
        let kind = self.flatten_kind(kind)?;
        Ok(Value::Obj(self.alloc(Obj::Reference(kind))))
    }

    fn flatten_kind(&mut self, kind: RefKind) -> Result<RefKind, RuntimeError> {
        let mut kind = kind;
        let mut visited: Vec<Handle> = Vec::new();
        loop {
            // A target that cannot be read yet (e.g. a reference to a
            // not-yet-defined global) is left unflattened.
            let target = match self.read_location(&kind) {
                Ok(value) => value,
                Err(_) => return Ok(kind),
            };
            let Value::Obj(handle) = target else {
                return Ok(kind);
            };
            let next = match self.heap().get(handle) {
                Some(Obj::Reference(inner)) => inner.clone(),
                _ => return Ok(kind),
            };
            if visited.contains(&handle) {
                return Err(RuntimeError::msg("circular reference chain"));
            }
            if visited.len() >= MAX_REF_HOPS {
                return Err(RuntimeError::msg("reference chain too long"));
            }
            visited.push(handle);
            kind = next;
        }
    }

    /// Assigns through a reference value. `recursive` is the DEREF_SET
    /// behavior: chase intermediate references before storing. SLOT_SET
    /// passes `false` and overwrites the first target directly.
    ///
    /// The one rebind exception: storing a reference value into a global
    /// whose slot already holds a global-alias reference replaces the
    /// alias instead of writing through it.
    ///
    /// Public so native functions can assign through reference arguments.
    pub fn write_reference(
        &mut self,
        reference: Value,
        value: Value,
        recursive: bool,
    ) -> Result<(), RuntimeError> {
        let Value::Obj(handle) = reference else {
            return Err(RuntimeError::msg(format!(
                "cannot assign through a value of type '{}'",
                self.value_type_name(&reference)
            )));
        };
        let mut kind = match self.heap().get(handle) {
            Some(Obj::Reference(kind)) => kind.clone(),
            Some(Obj::NativeRef(handler)) => {
                let handler = Rc::clone(handler);
                return handler.write(self, value);
            }
            _ => {
                return Err(RuntimeError::msg(format!(
                    "cannot assign through a value of type '{}'",
                    self.value_type_name(&reference)
                )))
            }
        };
        let mut hops = 0;
        loop {
            if hops >= MAX_REF_HOPS {
                return Err(RuntimeError::msg("reference chain too long"));
            }
            hops += 1;
            match kind {
                RefKind::Local(slot) => {
                    if slot >= self.stack.len() {
                        return Err(RuntimeError::msg(
                            "dead reference: the referenced stack slot no longer exists",
                        ));
                    }
                    if recursive {
                        if let Some(next) = self.reference_kind_of(&self.stack[slot]) {
                            kind = next;
                            continue;
                        }
                    }
                    self.stack[slot] = value;
                    return Ok(());
                }
                RefKind::Global(slot) => {
                    if recursive {
                        if let Some(current) = self.global_slot_value(slot) {
                            if let Some(next) = self.reference_kind_of(&current) {
                                if matches!(next, RefKind::Global(_)) && self.is_reference(&value)
                                {
                                    // Rebind: a reference stored over a
                                    // global alias replaces the alias.
                                    self.set_global_slot(slot, value);
                                    return Ok(());
                                }
                                kind = next;
                                continue;
                            }
                        }
                    }
                    self.set_global_slot(slot, value);
                    return Ok(());
                }
                RefKind::Upvalue(upvalue) => {
                    if recursive {
                        let current = self.read_location(&RefKind::Upvalue(upvalue))?;
                        if let Some(next) = self.reference_kind_of(&current) {
                            kind = next;
                            continue;
                        }
                    }
                    self.upvalue_set(upvalue, value)?;
                    return Ok(());
                }
                RefKind::Index { container, index } => {
                    if recursive {
                        let current = self.index_get_raw(&container, &index)?;
                        if let Some(next) = self.reference_kind_of(&current) {
                            match next {
                                RefKind::Index { .. } | RefKind::Property { .. } => {
                                    return Err(RuntimeError::msg(
                                        "nested collection references are not supported",
                                    ));
                                }
                                _ => {
                                    kind = next;
                                    continue;
                                }
                            }
                        }
                    }
                    self.index_set_raw(&container, &index, value)?;
                    return Ok(());
                }
                RefKind::Property { container, key } => {
                    if recursive {
                        let current = self.prop_get_raw(&container, &key)?;
                        if let Some(next) = self.reference_kind_of(&current) {
                            match next {
                                RefKind::Index { .. } | RefKind::Property { .. } => {
                                    return Err(RuntimeError::msg(
                                        "nested collection references are not supported",
                                    ));
                                }
                                _ => {
                                    kind = next;
                                    continue;
                                }
                            }
                        }
                    }
                    self.prop_set_raw(&container, &key, value)?;
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn reference_kind_of(&self, value: &Value) -> Option<RefKind> {
        if let Value::Obj(handle) = value {
            if let Some(Obj::Reference(kind)) = self.heap().get(*handle) {
                return Some(kind.clone());
            }
        }
        None
    }

    pub(crate) fn upvalue_set(
        &mut self,
        upvalue: Handle,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let slot = match self.heap().get(upvalue) {
            Some(Obj::Upvalue(UpvalueState::Open(slot))) => Some(*slot),
            Some(Obj::Upvalue(UpvalueState::Closed(_))) => None,
            _ => {
                return Err(RuntimeError::msg(
                    "dead reference: the referenced upvalue was collected",
                ))
            }
        };
        match slot {
            Some(slot) => {
                if slot >= self.stack.len() {
                    return Err(RuntimeError::msg(
                        "dead reference: the referenced stack slot no longer exists",
                    ));
                }
                self.stack[slot] = value;
            }
            None => {
                if let Some(Obj::Upvalue(state)) = self.heap_mut().get_mut(upvalue) {
                    *state = UpvalueState::Closed(value);
                }
            }
        }
        Ok(())
    }

    // ----- container element access ------------------------------------

    /// Element read with an already-dereferenced container and index.
    pub(crate) fn index_get_raw(
        &self,
        container: &Value,
        index: &Value,
    ) -> Result<Value, RuntimeError> {
        if let Value::Obj(handle) = container {
            match self.heap().get(*handle) {
                Some(Obj::List(items)) => {
                    let i = self.list_index(index, items.len())?;
                    return Ok(items[i]);
                }
                Some(Obj::Map(entries)) => {
                    let key = self.map_key(index)?;
                    return entries.get(&key).copied().ok_or_else(|| {
                        RuntimeError::msg(format!(
                            "missing key '{}' in map",
                            self.display(index)
                        ))
                    });
                }
                _ => {}
            }
        }
        Err(RuntimeError::msg(format!(
            "cannot index a value of type '{}'",
            self.value_type_name(container)
        )))
    }

    pub(crate) fn index_set_raw(
        &mut self,
        container: &Value,
        index: &Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        if let Value::Obj(handle) = container {
            let handle = *handle;
            match self.heap().get(handle) {
                Some(Obj::List(items)) => {
                    let i = self.list_index(index, items.len())?;
                    if let Some(Obj::List(items)) = self.heap_mut().get_mut(handle) {
                        items[i] = value;
                    }
                    return Ok(());
                }
                Some(Obj::Map(_)) => {
                    let key = self.map_key(index)?;
                    if let Some(Obj::Map(entries)) = self.heap_mut().get_mut(handle) {
                        entries.insert(key, value);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(RuntimeError::msg(format!(
            "cannot index a value of type '{}'",
            self.value_type_name(container)
        )))
    }

    /// Field read: struct fields by name, or map entries keyed by the
    /// field's string name.
    pub(crate) fn prop_get_raw(&self, container: &Value, key: &Value) -> Result<Value, RuntimeError> {
        let name = self.str_value(key).ok_or_else(|| {
            RuntimeError::msg(format!(
                "field name must be a string, not '{}'",
                self.value_type_name(key)
            ))
        })?;
        if let Value::Obj(handle) = container {
            match self.heap().get(*handle) {
                Some(Obj::Struct { schema, fields }) => {
                    return match schema.field_index(name) {
                        Some(i) => Ok(fields[i]),
                        None => Err(RuntimeError::msg(format!(
                            "no field '{}' on struct '{}'",
                            name, schema.name
                        ))),
                    };
                }
                Some(Obj::Map(entries)) => {
                    return entries
                        .get(&MapKey::Str(name.to_string()))
                        .copied()
                        .ok_or_else(|| {
                            RuntimeError::msg(format!("missing key '{name}' in map"))
                        });
                }
                _ => {}
            }
        }
        Err(RuntimeError::msg(format!(
            "cannot access field '{}' on a value of type '{}'",
            name,
            self.value_type_name(container)
        )))
    }

    pub(crate) fn prop_set_raw(
        &mut self,
        container: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let name = self
            .str_value(key)
            .ok_or_else(|| {
                RuntimeError::msg(format!(
                    "field name must be a string, not '{}'",
                    self.value_type_name(key)
                ))
            })?
            .to_string();
        if let Value::Obj(handle) = container {
            let handle = *handle;
            match self.heap().get(handle) {
                Some(Obj::Struct { schema, .. }) => {
                    let i = schema.field_index(&name).ok_or_else(|| {
                        RuntimeError::msg(format!(
                            "no field '{}' on struct '{}'",
                            name, schema.name
                        ))
                    })?;
                    if let Some(Obj::Struct { fields, .. }) = self.heap_mut().get_mut(handle) {
                        fields[i] = value;
                    }
                    return Ok(());
                }
                Some(Obj::Map(_)) => {
                    if let Some(Obj::Map(entries)) = self.heap_mut().get_mut(handle) {
                        entries.insert(MapKey::Str(name), value);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(RuntimeError::msg(format!(
            "cannot access field '{}' on a value of type '{}'",
            name,
            self.value_type_name(container)
        )))
    }

    fn list_index(&self, index: &Value, len: usize) -> Result<usize, RuntimeError> {
        let Value::Num(n) = index else {
            return Err(RuntimeError::msg(format!(
                "list index must be a number, not '{}'",
                self.value_type_name(index)
            )));
        };
        if n.fract() != 0.0 || !n.is_finite() {
            return Err(RuntimeError::msg("list index must be an integer"));
        }
        let i = *n;
        if i < 0.0 || i >= len as f64 {
            return Err(RuntimeError::msg(format!(
                "list index {} out of range (length {len})",
                *n as i64
            )));
        }
        Ok(i as usize)
    }

    /// Converts a (dereferenced) value to a map key.
    pub(crate) fn map_key(&self, value: &Value) -> Result<MapKey, RuntimeError> {
        match value {
            Value::Null => Ok(MapKey::Null),
            Value::Bool(b) => Ok(MapKey::Bool(*b)),
            Value::Num(n) => MapKey::from_num(*n),
            Value::Enum { type_id, variant } => Ok(MapKey::Enum {
                type_id: *type_id,
                variant: *variant,
            }),
            Value::Obj(_) => match self.str_value(value) {
                Some(s) => Ok(MapKey::Str(s.to_string())),
                None => Err(RuntimeError::msg(format!(
                    "unhashable map key of type '{}'",
                    self.value_type_name(value)
                ))),
            },
        }
    }
}
