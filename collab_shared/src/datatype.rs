//! Self-describing data types for automatic transmission over binary pipes.
//!
//! A [`DataType`] is a dictionary of type descriptions: fourteen atomic
//! kinds plus user-defined compounds (pointers, fixed arrays, vectors,
//! structures) identified by stable 8-bit tags. The dictionary itself is
//! wire-encodable, so a peer can describe an object's type and ship the
//! object in one message.
//!
//! Objects are held as dynamic [`Value`] trees. Serialization rules:
//! - atomic values as raw bytes in the sender's byte order (receivers swap),
//! - `VarInt` and the length prefixes of strings and vectors in the
//!   byte-oriented variable-length form of [`crate::varint`],
//! - pointers as a presence byte optionally followed by the target,
//! - arrays, vectors, and structures as their elements in order, unpadded.
//!
//! Pointer types may be created with an unresolved target so that cyclic
//! (recursive) types can be declared; the target must be set before any
//! object of the type is serialized. Pointer bodies reference their target
//! by type ID, which is what breaks the cycle at the metamodel level.

use anyhow::{bail, Context, Result};

use crate::buffer::{ByteSink, ByteSource, MessageBuffer, MessageEditor, MessageReader, MessageWriter};
use crate::socket::ReliableReader;
use crate::varint;

/// Identifier of an atomic or compound type within one dictionary.
pub type TypeId = u8;

/// Upper bound on a single captured object serialization.
pub const MAX_OBJECT_SIZE: usize = 1 << 24;

/// Number of pre-defined atomic types.
pub const NUM_ATOMIC_TYPES: usize = 14;

/// Type ID assigned to the first user-defined compound type.
pub const FIRST_COMPOUND_TYPE: TypeId = 16;

/// Pre-defined atomic types with stable tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicType {
    Bool = 0,
    Char = 1,
    SInt8 = 2,
    SInt16 = 3,
    SInt32 = 4,
    SInt64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    VarInt = 12,
    String = 13,
}

impl AtomicType {
    pub const fn id(self) -> TypeId {
        self as TypeId
    }

    pub fn from_id(id: TypeId) -> Option<Self> {
        match id {
            0 => Some(AtomicType::Bool),
            1 => Some(AtomicType::Char),
            2 => Some(AtomicType::SInt8),
            3 => Some(AtomicType::SInt16),
            4 => Some(AtomicType::SInt32),
            5 => Some(AtomicType::SInt64),
            6 => Some(AtomicType::UInt8),
            7 => Some(AtomicType::UInt16),
            8 => Some(AtomicType::UInt32),
            9 => Some(AtomicType::UInt64),
            10 => Some(AtomicType::Float32),
            11 => Some(AtomicType::Float64),
            12 => Some(AtomicType::VarInt),
            13 => Some(AtomicType::String),
            _ => None,
        }
    }

    /// Minimum wire size in bytes.
    fn min_size(self) -> usize {
        match self {
            AtomicType::Bool | AtomicType::Char => 1,
            AtomicType::SInt8 | AtomicType::UInt8 => 1,
            AtomicType::SInt16 | AtomicType::UInt16 => 2,
            AtomicType::SInt32 | AtomicType::UInt32 | AtomicType::Float32 => 4,
            AtomicType::SInt64 | AtomicType::UInt64 | AtomicType::Float64 => 8,
            // Smallest VarInt, and a string's empty length prefix.
            AtomicType::VarInt | AtomicType::String => 1,
        }
    }

    fn fixed_size(self) -> bool {
        !matches!(self, AtomicType::VarInt | AtomicType::String)
    }
}

/// Wire tags for compound kinds in the dictionary encoding.
const KIND_POINTER: u8 = 0;
const KIND_FIXED_ARRAY: u8 = 1;
const KIND_VECTOR: u8 = 2;
const KIND_STRUCTURE: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Compound {
    /// Optional reference to a target object; `None` until resolved.
    Pointer { element: Option<TypeId> },
    FixedArray { len: u32, element: TypeId },
    Vector { element: TypeId },
    Structure { elements: Vec<TypeId> },
}

/// A dictionary of type descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataType {
    compounds: Vec<Compound>,
}

impl DataType {
    /// Creates a dictionary with no user-defined types.
    pub fn new() -> Self {
        DataType::default()
    }

    fn next_id(&self) -> Result<TypeId> {
        let next = FIRST_COMPOUND_TYPE as usize + self.compounds.len();
        if next > TypeId::MAX as usize {
            bail!("type dictionary full");
        }
        Ok(next as TypeId)
    }

    fn compound(&self, id: TypeId) -> Result<&Compound> {
        if id < FIRST_COMPOUND_TYPE {
            bail!("type {id} is not a compound type");
        }
        self.compounds
            .get((id - FIRST_COMPOUND_TYPE) as usize)
            .with_context(|| format!("undefined type {id}"))
    }

    fn check_defined(&self, id: TypeId) -> Result<()> {
        if !self.is_defined(id) {
            bail!("undefined type {id}");
        }
        Ok(())
    }

    pub fn is_defined(&self, id: TypeId) -> bool {
        AtomicType::from_id(id).is_some()
            || (id >= FIRST_COMPOUND_TYPE
                && ((id - FIRST_COMPOUND_TYPE) as usize) < self.compounds.len())
    }

    pub fn is_atomic(&self, id: TypeId) -> bool {
        AtomicType::from_id(id).is_some()
    }

    /// Defines a pointer with a not-yet-known target, for cyclic types.
    pub fn create_pointer(&mut self) -> Result<TypeId> {
        let id = self.next_id()?;
        self.compounds.push(Compound::Pointer { element: None });
        Ok(id)
    }

    /// Resolves the target of a pointer created by [`Self::create_pointer`].
    pub fn set_pointer_element(&mut self, pointer: TypeId, element: TypeId) -> Result<()> {
        self.check_defined(element)?;
        if pointer < FIRST_COMPOUND_TYPE {
            bail!("type {pointer} is not a pointer");
        }
        let index = (pointer - FIRST_COMPOUND_TYPE) as usize;
        match self.compounds.get_mut(index) {
            Some(Compound::Pointer {
                element: slot @ None,
            }) => {
                *slot = Some(element);
                Ok(())
            }
            Some(Compound::Pointer { .. }) => bail!("pointer type {pointer} already resolved"),
            _ => bail!("type {pointer} is not a pointer"),
        }
    }

    /// Defines a pointer to a known target.
    pub fn create_pointer_to(&mut self, element: TypeId) -> Result<TypeId> {
        self.check_defined(element)?;
        let id = self.next_id()?;
        self.compounds.push(Compound::Pointer {
            element: Some(element),
        });
        Ok(id)
    }

    pub fn create_fixed_array(&mut self, len: u32, element: TypeId) -> Result<TypeId> {
        self.check_defined(element)?;
        let id = self.next_id()?;
        self.compounds.push(Compound::FixedArray { len, element });
        Ok(id)
    }

    pub fn create_vector(&mut self, element: TypeId) -> Result<TypeId> {
        self.check_defined(element)?;
        let id = self.next_id()?;
        self.compounds.push(Compound::Vector { element });
        Ok(id)
    }

    pub fn create_structure(&mut self, elements: &[TypeId]) -> Result<TypeId> {
        for &element in elements {
            self.check_defined(element)?;
        }
        let id = self.next_id()?;
        self.compounds.push(Compound::Structure {
            elements: elements.to_vec(),
        });
        Ok(id)
    }

    fn pointer_element(&self, id: TypeId) -> Result<TypeId> {
        match self.compound(id)? {
            Compound::Pointer { element: Some(e) } => Ok(*e),
            Compound::Pointer { element: None } => {
                bail!("pointer type {id} used before its target was set")
            }
            _ => bail!("type {id} is not a pointer"),
        }
    }

    /// True iff the wire size of the type is known a priori: no `VarInt`,
    /// `String`, `Vector`, or `Pointer` is reachable.
    pub fn has_fixed_size(&self, id: TypeId) -> bool {
        if let Some(atomic) = AtomicType::from_id(id) {
            return atomic.fixed_size();
        }
        match self.compound(id) {
            Ok(Compound::Pointer { .. }) => false,
            Ok(Compound::Vector { .. }) => false,
            Ok(Compound::FixedArray { element, .. }) => self.has_fixed_size(*element),
            Ok(Compound::Structure { elements }) => {
                elements.iter().all(|&e| self.has_fixed_size(e))
            }
            Err(_) => false,
        }
    }

    /// Minimum possible wire size of an object of the type.
    pub fn min_size(&self, id: TypeId) -> Result<usize> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return Ok(atomic.min_size());
        }
        match self.compound(id)? {
            // Just the presence flag.
            Compound::Pointer { .. } => Ok(1),
            // An empty length prefix.
            Compound::Vector { .. } => Ok(1),
            Compound::FixedArray { len, element } => {
                Ok(*len as usize * self.min_size(*element)?)
            }
            Compound::Structure { elements } => {
                let mut total = 0;
                for &element in elements {
                    total += self.min_size(element)?;
                }
                Ok(total)
            }
        }
    }

    /* Dictionary wire form. */

    /// Wire size of the dictionary itself.
    pub fn calc_dictionary_size(&self) -> usize {
        let mut total = varint::size(self.compounds.len() as u32);
        for compound in &self.compounds {
            total += 1;
            total += match compound {
                Compound::Pointer { .. } => 1,
                Compound::FixedArray { len, .. } => varint::size(*len) + 1,
                Compound::Vector { .. } => 1,
                Compound::Structure { elements } => {
                    varint::size(elements.len() as u32) + elements.len()
                }
            };
        }
        total
    }

    /// Writes the dictionary. Every pointer target must be resolved.
    pub fn write_dictionary<S: ByteSink>(&self, sink: &mut S) -> Result<()> {
        varint::write(self.compounds.len() as u32, sink);
        for (index, compound) in self.compounds.iter().enumerate() {
            match compound {
                Compound::Pointer { element } => {
                    let element = element.with_context(|| {
                        format!(
                            "pointer type {} has no target",
                            FIRST_COMPOUND_TYPE as usize + index
                        )
                    })?;
                    sink.put_u8(KIND_POINTER);
                    sink.put_u8(element);
                }
                Compound::FixedArray { len, element } => {
                    sink.put_u8(KIND_FIXED_ARRAY);
                    varint::write(*len, sink);
                    sink.put_u8(*element);
                }
                Compound::Vector { element } => {
                    sink.put_u8(KIND_VECTOR);
                    sink.put_u8(*element);
                }
                Compound::Structure { elements } => {
                    sink.put_u8(KIND_STRUCTURE);
                    varint::write(elements.len() as u32, sink);
                    for &element in elements {
                        sink.put_u8(element);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads and validates a dictionary from its wire form.
    pub fn read_dictionary<S: ByteSource>(source: &mut S) -> Result<DataType> {
        let count = varint::read(source)?;
        let max = (TypeId::MAX as usize - FIRST_COMPOUND_TYPE as usize) + 1;
        if count as usize > max {
            bail!("dictionary declares {count} compound types, limit is {max}");
        }

        let valid_ref = |id: TypeId| -> Result<TypeId> {
            let defined = AtomicType::from_id(id).is_some()
                || (id >= FIRST_COMPOUND_TYPE
                    && ((id - FIRST_COMPOUND_TYPE) as u32) < count);
            if !defined {
                bail!("dictionary references undefined type {id}");
            }
            Ok(id)
        };

        let mut compounds = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = source.get_u8()?;
            compounds.push(match kind {
                KIND_POINTER => Compound::Pointer {
                    element: Some(valid_ref(source.get_u8()?)?),
                },
                KIND_FIXED_ARRAY => {
                    let len = varint::read(source)?;
                    Compound::FixedArray {
                        len,
                        element: valid_ref(source.get_u8()?)?,
                    }
                }
                KIND_VECTOR => Compound::Vector {
                    element: valid_ref(source.get_u8()?)?,
                },
                KIND_STRUCTURE => {
                    let num = varint::read(source)?;
                    if num as usize > TypeId::MAX as usize {
                        bail!("structure declares {num} elements");
                    }
                    let mut elements = Vec::with_capacity(num as usize);
                    for _ in 0..num {
                        elements.push(valid_ref(source.get_u8()?)?);
                    }
                    Compound::Structure { elements }
                }
                other => bail!("unknown compound kind tag {other}"),
            });
        }
        Ok(DataType { compounds })
    }

    /* Object model. */

    /// Creates the default in-memory object of the type: pointers null,
    /// vectors and strings empty, numbers zero.
    pub fn create_object(&self, id: TypeId) -> Result<Value> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return Ok(match atomic {
                AtomicType::Bool => Value::Bool(false),
                AtomicType::Char => Value::Char(0),
                AtomicType::SInt8 => Value::SInt8(0),
                AtomicType::SInt16 => Value::SInt16(0),
                AtomicType::SInt32 => Value::SInt32(0),
                AtomicType::SInt64 => Value::SInt64(0),
                AtomicType::UInt8 => Value::UInt8(0),
                AtomicType::UInt16 => Value::UInt16(0),
                AtomicType::UInt32 => Value::UInt32(0),
                AtomicType::UInt64 => Value::UInt64(0),
                AtomicType::Float32 => Value::Float32(0.0),
                AtomicType::Float64 => Value::Float64(0.0),
                AtomicType::VarInt => Value::VarInt(0),
                AtomicType::String => Value::String(Vec::new()),
            });
        }
        match self.compound(id)? {
            Compound::Pointer { .. } => Ok(Value::Pointer(None)),
            Compound::Vector { .. } => Ok(Value::Vector(Vec::new())),
            Compound::FixedArray { len, element } => {
                let mut items = Vec::with_capacity(*len as usize);
                for _ in 0..*len {
                    items.push(self.create_object(*element)?);
                }
                Ok(Value::FixedArray(items))
            }
            Compound::Structure { elements } => {
                let elements = elements.clone();
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.create_object(element)?);
                }
                Ok(Value::Structure(items))
            }
        }
    }

    /// Exact wire size of the given object.
    pub fn calc_size(&self, id: TypeId, value: &Value) -> Result<usize> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return match (atomic, value) {
                (AtomicType::VarInt, Value::VarInt(v)) => Ok(varint::size(*v)),
                (AtomicType::String, Value::String(bytes)) => {
                    Ok(varint::size(bytes.len() as u32) + bytes.len())
                }
                _ => Ok(atomic.min_size()),
            };
        }
        match (self.compound(id)?, value) {
            (Compound::Pointer { .. }, Value::Pointer(None)) => Ok(1),
            (Compound::Pointer { .. }, Value::Pointer(Some(target))) => {
                Ok(1 + self.calc_size(self.pointer_element(id)?, target)?)
            }
            (Compound::FixedArray { len, element }, Value::FixedArray(items)) => {
                if items.len() != *len as usize {
                    bail!("fixed array has {} items, type declares {len}", items.len());
                }
                let mut total = 0;
                for item in items {
                    total += self.calc_size(*element, item)?;
                }
                Ok(total)
            }
            (Compound::Vector { element }, Value::Vector(items)) => {
                let mut total = varint::size(items.len() as u32);
                for item in items {
                    total += self.calc_size(*element, item)?;
                }
                Ok(total)
            }
            (Compound::Structure { elements }, Value::Structure(items)) => {
                if items.len() != elements.len() {
                    bail!(
                        "structure has {} items, type declares {}",
                        items.len(),
                        elements.len()
                    );
                }
                let mut total = 0;
                for (&element, item) in elements.iter().zip(items) {
                    total += self.calc_size(element, item)?;
                }
                Ok(total)
            }
            _ => bail!("object does not match type {id}"),
        }
    }

    /// Serializes the given object to the writer.
    pub fn write_object(&self, id: TypeId, value: &Value, writer: &mut MessageWriter) -> Result<()> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return match (atomic, value) {
                (AtomicType::Bool, Value::Bool(v)) => Ok(writer.write_bool(*v)),
                (AtomicType::Char, Value::Char(v)) => Ok(writer.write_u8(*v)),
                (AtomicType::SInt8, Value::SInt8(v)) => Ok(writer.write_i8(*v)),
                (AtomicType::SInt16, Value::SInt16(v)) => Ok(writer.write_i16(*v)),
                (AtomicType::SInt32, Value::SInt32(v)) => Ok(writer.write_i32(*v)),
                (AtomicType::SInt64, Value::SInt64(v)) => Ok(writer.write_i64(*v)),
                (AtomicType::UInt8, Value::UInt8(v)) => Ok(writer.write_u8(*v)),
                (AtomicType::UInt16, Value::UInt16(v)) => Ok(writer.write_u16(*v)),
                (AtomicType::UInt32, Value::UInt32(v)) => Ok(writer.write_u32(*v)),
                (AtomicType::UInt64, Value::UInt64(v)) => Ok(writer.write_u64(*v)),
                (AtomicType::Float32, Value::Float32(v)) => Ok(writer.write_f32(*v)),
                (AtomicType::Float64, Value::Float64(v)) => Ok(writer.write_f64(*v)),
                (AtomicType::VarInt, Value::VarInt(v)) => Ok(varint::write(*v, writer)),
                (AtomicType::String, Value::String(bytes)) => {
                    varint::write(bytes.len() as u32, writer);
                    writer.write_raw(bytes);
                    Ok(())
                }
                _ => bail!("object does not match atomic type {id}"),
            };
        }
        match (self.compound(id)?.clone(), value) {
            (Compound::Pointer { .. }, Value::Pointer(None)) => {
                // Target must be resolvable even for a null pointer so the
                // peer can decode the type.
                self.pointer_element(id)?;
                writer.write_bool(false);
                Ok(())
            }
            (Compound::Pointer { .. }, Value::Pointer(Some(target))) => {
                let element = self.pointer_element(id)?;
                writer.write_bool(true);
                self.write_object(element, target, writer)
            }
            (Compound::FixedArray { len, element }, Value::FixedArray(items)) => {
                if items.len() != len as usize {
                    bail!("fixed array has {} items, type declares {len}", items.len());
                }
                for item in items {
                    self.write_object(element, item, writer)?;
                }
                Ok(())
            }
            (Compound::Vector { element }, Value::Vector(items)) => {
                varint::write(items.len() as u32, writer);
                for item in items {
                    self.write_object(element, item, writer)?;
                }
                Ok(())
            }
            (Compound::Structure { elements }, Value::Structure(items)) => {
                if items.len() != elements.len() {
                    bail!(
                        "structure has {} items, type declares {}",
                        items.len(),
                        elements.len()
                    );
                }
                for (&element, item) in elements.iter().zip(items) {
                    self.write_object(element, item, writer)?;
                }
                Ok(())
            }
            _ => bail!("object does not match type {id}"),
        }
    }

    /// Deserializes an object of the type from the reader.
    pub fn read_object(&self, id: TypeId, reader: &mut MessageReader<'_>) -> Result<Value> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return Ok(match atomic {
                AtomicType::Bool => Value::Bool(reader.read_bool()?),
                AtomicType::Char => Value::Char(reader.read_u8()?),
                AtomicType::SInt8 => Value::SInt8(reader.read_i8()?),
                AtomicType::SInt16 => Value::SInt16(reader.read_i16()?),
                AtomicType::SInt32 => Value::SInt32(reader.read_i32()?),
                AtomicType::SInt64 => Value::SInt64(reader.read_i64()?),
                AtomicType::UInt8 => Value::UInt8(reader.read_u8()?),
                AtomicType::UInt16 => Value::UInt16(reader.read_u16()?),
                AtomicType::UInt32 => Value::UInt32(reader.read_u32()?),
                AtomicType::UInt64 => Value::UInt64(reader.read_u64()?),
                AtomicType::Float32 => Value::Float32(reader.read_f32()?),
                AtomicType::Float64 => Value::Float64(reader.read_f64()?),
                AtomicType::VarInt => Value::VarInt(varint::read(reader)?),
                AtomicType::String => {
                    let len = varint::read(reader)? as usize;
                    if len > reader.remaining() {
                        bail!("string length {len} exceeds remaining bytes");
                    }
                    Value::String(reader.read_bytes(len)?.to_vec())
                }
            });
        }
        match self.compound(id)?.clone() {
            Compound::Pointer { .. } => {
                let element = self.pointer_element(id)?;
                match reader.read_u8()? {
                    0 => Ok(Value::Pointer(None)),
                    1 => Ok(Value::Pointer(Some(Box::new(
                        self.read_object(element, reader)?,
                    )))),
                    other => bail!("invalid pointer presence flag {other}"),
                }
            }
            Compound::FixedArray { len, element } => {
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(self.read_object(element, reader)?);
                }
                Ok(Value::FixedArray(items))
            }
            Compound::Vector { element } => {
                let len = varint::read(reader)? as usize;
                if len > reader.remaining() {
                    bail!("vector length {len} exceeds remaining bytes");
                }
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.read_object(element, reader)?);
                }
                Ok(Value::Vector(items))
            }
            Compound::Structure { elements } => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.read_object(element, reader)?);
                }
                Ok(Value::Structure(items))
            }
        }
    }

    /// Validates the structural bounds of a serialized object without
    /// materializing it.
    pub fn check_serialization(&self, id: TypeId, reader: &mut MessageReader<'_>) -> Result<()> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return match atomic {
                AtomicType::Bool => match reader.read_u8()? {
                    0 | 1 => Ok(()),
                    other => bail!("invalid boolean encoding {other}"),
                },
                AtomicType::VarInt => varint::read(reader).map(|_| ()),
                AtomicType::String => {
                    let len = varint::read(reader)? as usize;
                    if len > reader.remaining() {
                        bail!("string length {len} exceeds remaining bytes");
                    }
                    reader.skip(len)
                }
                other => reader.skip(other.min_size()),
            };
        }
        match self.compound(id)?.clone() {
            Compound::Pointer { .. } => {
                let element = self.pointer_element(id)?;
                match reader.read_u8()? {
                    0 => Ok(()),
                    1 => self.check_serialization(element, reader),
                    other => bail!("invalid pointer presence flag {other}"),
                }
            }
            Compound::FixedArray { len, element } => {
                for _ in 0..len {
                    self.check_serialization(element, reader)?;
                }
                Ok(())
            }
            Compound::Vector { element } => {
                let len = varint::read(reader)? as usize;
                if len > reader.remaining() {
                    bail!("vector length {len} exceeds remaining bytes");
                }
                for _ in 0..len {
                    self.check_serialization(element, reader)?;
                }
                Ok(())
            }
            Compound::Structure { elements } => {
                for element in elements {
                    self.check_serialization(element, reader)?;
                }
                Ok(())
            }
        }
    }

    /// Byte-reverses every multi-byte atomic field of a serialized object in
    /// place. Applying it twice is the identity.
    pub fn swap_endianness(&self, id: TypeId, editor: &mut MessageEditor) -> Result<()> {
        if let Some(atomic) = AtomicType::from_id(id) {
            return match atomic {
                AtomicType::VarInt => {
                    // Byte-oriented, never swapped; just step across it.
                    let (remaining, _) = varint::read_first(editor)?;
                    editor.skip(remaining)
                }
                AtomicType::String => {
                    let len = varint::read(editor)? as usize;
                    editor.skip(len)
                }
                other => match other.min_size() {
                    1 => editor.skip(1),
                    n => editor.reverse(n),
                },
            };
        }
        match self.compound(id)?.clone() {
            Compound::Pointer { .. } => {
                let element = self.pointer_element(id)?;
                if editor.read_u8()? != 0 {
                    self.swap_endianness(element, editor)?;
                }
                Ok(())
            }
            Compound::FixedArray { len, element } => {
                for _ in 0..len {
                    self.swap_endianness(element, editor)?;
                }
                Ok(())
            }
            Compound::Vector { element } => {
                let len = varint::read(editor)? as usize;
                for _ in 0..len {
                    self.swap_endianness(element, editor)?;
                }
                Ok(())
            }
            Compound::Structure { elements } => {
                for element in elements {
                    self.swap_endianness(element, editor)?;
                }
                Ok(())
            }
        }
    }

    /* Serialized objects as opaque byte blocks. */

    /// Serializes an object into a bare byte block (no size prefix).
    pub fn serialize_object(&self, id: TypeId, value: &Value) -> Result<Vec<u8>> {
        let mut writer = MessageWriter::headerless(self.calc_size(id, value)?);
        self.write_object(id, value, &mut writer)?;
        Ok(writer.finish().payload().to_vec())
    }

    /// Writes a bare serialization onto the wire, prefixing its byte count
    /// as a `VarInt` when the type's size is not fixed.
    pub fn write_sized_bytes(&self, id: TypeId, bytes: &[u8], writer: &mut MessageWriter) {
        if !self.has_fixed_size(id) {
            varint::write(bytes.len() as u32, writer);
        }
        writer.write_raw(bytes);
    }

    /// Wire size of a bare serialization once the size prefix is added.
    pub fn sized_len(&self, id: TypeId, bytes: &[u8]) -> usize {
        if self.has_fixed_size(id) {
            bytes.len()
        } else {
            varint::size(bytes.len() as u32) + bytes.len()
        }
    }

    /// Reads a maybe-size-prefixed serialization from a complete message,
    /// returning the bare bytes.
    pub fn read_sized_bytes<'a>(
        &self,
        id: TypeId,
        reader: &mut MessageReader<'a>,
    ) -> Result<&'a [u8]> {
        let len = if self.has_fixed_size(id) {
            self.min_size(id)?
        } else {
            let len = varint::read(reader)? as usize;
            if len > reader.remaining() {
                bail!("object size {len} exceeds remaining bytes");
            }
            len
        };
        reader.read_bytes(len)
    }

    /// Validates a captured serialization and brings it into host byte
    /// order: swaps in place when the sender's order differed, checks
    /// structural bounds either way. The serialization must span the block
    /// exactly.
    pub fn normalize_object_bytes(&self, id: TypeId, bytes: Vec<u8>, swap: bool) -> Result<Vec<u8>> {
        if swap {
            let buffer = MessageBuffer::from_bytes(bytes::Bytes::from(bytes));
            let mut editor = buffer.edit();
            self.swap_endianness(id, &mut editor)?;
            if editor.remaining() != 0 {
                bail!("{} trailing bytes after object", editor.remaining());
            }
            let normalized = editor.finish().payload().to_vec();
            let mut reader = MessageReader::new(&normalized, false);
            self.check_serialization(id, &mut reader)?;
            Ok(normalized)
        } else {
            let mut reader = MessageReader::new(&bytes, false);
            self.check_serialization(id, &mut reader)?;
            if !reader.is_empty() {
                bail!("{} trailing bytes after object", reader.remaining());
            }
            Ok(bytes)
        }
    }

    /* Incremental reads from a socket. */

    /// Reads a dictionary's wire form directly off a reliable socket,
    /// suspending at the socket's await points as bytes trickle in.
    pub async fn read_dictionary_socket(reader: &mut ReliableReader) -> Result<DataType> {
        let count = reader.read_varint().await?;
        let max = (TypeId::MAX as usize - FIRST_COMPOUND_TYPE as usize) + 1;
        if count as usize > max {
            bail!("dictionary declares {count} compound types, limit is {max}");
        }

        let valid_ref = |id: TypeId| -> Result<TypeId> {
            let defined = AtomicType::from_id(id).is_some()
                || (id >= FIRST_COMPOUND_TYPE && ((id - FIRST_COMPOUND_TYPE) as u32) < count);
            if !defined {
                bail!("dictionary references undefined type {id}");
            }
            Ok(id)
        };

        let mut compounds = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = reader.read_u8().await?;
            compounds.push(match kind {
                KIND_POINTER => Compound::Pointer {
                    element: Some(valid_ref(reader.read_u8().await?)?),
                },
                KIND_FIXED_ARRAY => {
                    let len = reader.read_varint().await?;
                    Compound::FixedArray {
                        len,
                        element: valid_ref(reader.read_u8().await?)?,
                    }
                }
                KIND_VECTOR => Compound::Vector {
                    element: valid_ref(reader.read_u8().await?)?,
                },
                KIND_STRUCTURE => {
                    let num = reader.read_varint().await?;
                    if num as usize > TypeId::MAX as usize {
                        bail!("structure declares {num} elements");
                    }
                    let mut elements = Vec::with_capacity(num as usize);
                    for _ in 0..num {
                        elements.push(valid_ref(reader.read_u8().await?)?);
                    }
                    Compound::Structure { elements }
                }
                other => bail!("unknown compound kind tag {other}"),
            });
        }
        Ok(DataType { compounds })
    }

    /// Captures a maybe-size-prefixed object serialization off a reliable
    /// socket without materializing it, returning the bare bytes in the
    /// sender's byte order.
    pub async fn read_object_bytes_socket(
        &self,
        id: TypeId,
        reader: &mut ReliableReader,
    ) -> Result<Vec<u8>> {
        let len = if self.has_fixed_size(id) {
            self.min_size(id)?
        } else {
            reader.read_varint().await? as usize
        };
        if len > MAX_OBJECT_SIZE {
            bail!("object serialization of {len} bytes exceeds the limit");
        }
        reader.read_vec(len).await
    }

    /// Human-readable dump of an object, for the server console.
    pub fn format_object(&self, id: TypeId, value: &Value) -> String {
        let mut out = String::new();
        self.format_into(id, value, &mut out);
        out
    }

    fn format_into(&self, id: TypeId, value: &Value, out: &mut String) {
        use std::fmt::Write as _;
        match value {
            Value::Bool(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Char(v) => {
                let _ = write!(out, "{:?}", char::from(*v));
            }
            Value::SInt8(v) => {
                let _ = write!(out, "{v}");
            }
            Value::SInt16(v) => {
                let _ = write!(out, "{v}");
            }
            Value::SInt32(v) => {
                let _ = write!(out, "{v}");
            }
            Value::SInt64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::UInt8(v) => {
                let _ = write!(out, "{v}");
            }
            Value::UInt16(v) => {
                let _ = write!(out, "{v}");
            }
            Value::UInt32(v) => {
                let _ = write!(out, "{v}");
            }
            Value::UInt64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Float32(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Float64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::VarInt(v) => {
                let _ = write!(out, "{v}");
            }
            Value::String(bytes) => {
                let _ = write!(out, "{:?}", String::from_utf8_lossy(bytes));
            }
            Value::Pointer(None) => out.push_str("null"),
            Value::Pointer(Some(target)) => {
                out.push('&');
                let element = self.pointer_element(id).unwrap_or(id);
                self.format_into(element, target, out);
            }
            Value::FixedArray(items) | Value::Vector(items) => {
                let element = match self.compound(id) {
                    Ok(Compound::FixedArray { element, .. }) | Ok(Compound::Vector { element }) => {
                        *element
                    }
                    _ => id,
                };
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.format_into(element, item, out);
                }
                out.push(']');
            }
            Value::Structure(items) => {
                let elements = match self.compound(id) {
                    Ok(Compound::Structure { elements }) => elements.clone(),
                    _ => Vec::new(),
                };
                out.push('{');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let element = elements.get(i).copied().unwrap_or(id);
                    self.format_into(element, item, out);
                }
                out.push('}');
            }
        }
    }
}

/// Dynamic in-memory representation of an object of some dictionary type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(u8),
    SInt8(i8),
    SInt16(i16),
    SInt32(i32),
    SInt64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    VarInt(u32),
    String(Vec<u8>),
    Pointer(Option<Box<Value>>),
    FixedArray(Vec<Value>),
    Vector(Vec<Value>),
    Structure(Vec<Value>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn string(s: &str) -> Value {
        Value::String(s.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A structure { Bool, UInt32, String, Vector<SInt16> }.
    fn sample_dictionary() -> (DataType, TypeId) {
        let mut dict = DataType::new();
        let vec16 = dict.create_vector(AtomicType::SInt16.id()).unwrap();
        let structure = dict
            .create_structure(&[
                AtomicType::Bool.id(),
                AtomicType::UInt32.id(),
                AtomicType::String.id(),
                vec16,
            ])
            .unwrap();
        (dict, structure)
    }

    fn sample_value() -> Value {
        Value::Structure(vec![
            Value::Bool(true),
            Value::UInt32(0x1122_3344),
            Value::string("hello"),
            Value::Vector(vec![Value::SInt16(-1), Value::SInt16(515)]),
        ])
    }

    fn serialize(dict: &DataType, ty: TypeId, value: &Value) -> crate::buffer::MessageBuffer {
        let mut writer = MessageWriter::headerless(64);
        dict.write_object(ty, value, &mut writer).unwrap();
        writer.finish()
    }

    #[test]
    fn object_roundtrip_preserves_equality() {
        let (dict, ty) = sample_dictionary();
        let value = sample_value();
        let buf = serialize(&dict, ty, &value);

        assert_eq!(dict.calc_size(ty, &value).unwrap(), buf.len());

        let mut reader = buf.payload_reader(false);
        let back = dict.read_object(ty, &mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(back, value);
    }

    #[test]
    fn check_serialization_accepts_written_objects() {
        let (dict, ty) = sample_dictionary();
        let buf = serialize(&dict, ty, &sample_value());
        let mut reader = buf.payload_reader(false);
        dict.check_serialization(ty, &mut reader).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn check_serialization_rejects_oversized_vector() {
        let (dict, ty) = sample_dictionary();
        let mut writer = MessageWriter::headerless(16);
        writer.write_bool(true);
        writer.write_u32(1);
        // Empty string, then a vector claiming far more entries than bytes.
        varint::write(0, &mut writer);
        varint::write(1000, &mut writer);
        writer.write_i16(0);
        let buf = writer.finish();
        let mut reader = buf.payload_reader(false);
        assert!(dict.check_serialization(ty, &mut reader).is_err());
    }

    #[test]
    fn swap_twice_is_identity_and_swapped_read_matches() {
        let (dict, ty) = sample_dictionary();
        let value = sample_value();
        let buf = serialize(&dict, ty, &value);
        let original = buf.payload().to_vec();

        let mut editor = buf.edit();
        dict.swap_endianness(ty, &mut editor).unwrap();
        let swapped = editor.finish();
        assert_ne!(swapped.payload(), &original[..]);

        // A reader with the swap flag set sees the original values.
        let mut reader = swapped.payload_reader(true);
        let back = dict.read_object(ty, &mut reader).unwrap();
        assert_eq!(back, value);

        let mut editor = swapped.edit();
        dict.swap_endianness(ty, &mut editor).unwrap();
        assert_eq!(editor.finish().payload(), &original[..]);
    }

    #[test]
    fn dictionary_roundtrips_and_compares_equal() {
        let (dict, _) = sample_dictionary();
        let mut writer = MessageWriter::headerless(32);
        dict.write_dictionary(&mut writer).unwrap();
        let buf = writer.finish();
        assert_eq!(dict.calc_dictionary_size(), buf.len());

        let mut reader = buf.payload_reader(false);
        let back = DataType::read_dictionary(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(back, dict);
    }

    #[test]
    fn recursive_type_through_pointer() {
        // A singly-linked list node: { SInt32, Pointer -> node }.
        let mut dict = DataType::new();
        let pointer = dict.create_pointer().unwrap();
        let node = dict
            .create_structure(&[AtomicType::SInt32.id(), pointer])
            .unwrap();
        dict.set_pointer_element(pointer, node).unwrap();

        assert!(!dict.has_fixed_size(node));

        let list = Value::Structure(vec![
            Value::SInt32(1),
            Value::Pointer(Some(Box::new(Value::Structure(vec![
                Value::SInt32(2),
                Value::Pointer(None),
            ])))),
        ]);

        let buf = serialize(&dict, node, &list);
        let mut reader = buf.payload_reader(false);
        assert_eq!(dict.read_object(node, &mut reader).unwrap(), list);
    }

    #[test]
    fn unresolved_pointer_cannot_serialize() {
        let mut dict = DataType::new();
        let pointer = dict.create_pointer().unwrap();
        let mut writer = MessageWriter::headerless(4);
        assert!(dict
            .write_object(pointer, &Value::Pointer(None), &mut writer)
            .is_err());
    }

    #[test]
    fn fixed_size_flag() {
        let mut dict = DataType::new();
        let pair = dict
            .create_structure(&[AtomicType::UInt16.id(), AtomicType::Float64.id()])
            .unwrap();
        let arr = dict.create_fixed_array(4, pair).unwrap();
        let with_string = dict
            .create_structure(&[arr, AtomicType::String.id()])
            .unwrap();

        assert!(dict.has_fixed_size(pair));
        assert!(dict.has_fixed_size(arr));
        assert!(!dict.has_fixed_size(with_string));
        assert_eq!(dict.min_size(arr).unwrap(), 4 * 10);
    }
}
