//! Reader for the pre-zip `torch.save` layout
//!
//! Checkpoints written before PyTorch 1.6 are five pickles back to back
//! (magic number, protocol version, system info, the saved object, the sorted
//! storage keys) followed by the raw bytes of every storage in key order. Each
//! storage is prefixed with its element count as a little-endian `u64`.
//!
//! The pickles are interpreted with candle's pickle [`Stack`]; tensor
//! payloads are sliced out of the storage section.

use byteorder::{LittleEndian, ReadBytesExt};
use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// `0x1950a86a20f9469cfc6c` as pickled with `LONG1`
const MAGIC_NUMBER: [u8; 10] = [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];

/// `PROTO n`, `LONG1 10`, the magic bytes, `STOP`
const MAGIC_PICKLE_LEN: usize = 15;

const PROTOCOL_VERSION: i64 = 1001;

/// Local file header signature that starts every zip checkpoint
const ZIP_SIGNATURE: [u8; 4] = *b"PK\x03\x04";

/// Whether `header` opens a zip archive
pub fn is_zip(header: &[u8]) -> bool {
    header.starts_with(&ZIP_SIGNATURE)
}

/// Whether `header` opens with the legacy magic-number pickle
pub fn has_legacy_magic(header: &[u8]) -> bool {
    header.len() >= MAGIC_PICKLE_LEN
        && header[0] == 0x80
        && header[2] == 0x8a
        && header[3] == MAGIC_NUMBER.len() as u8
        && header[4..14] == MAGIC_NUMBER
        && header[14] == b'.'
}

/// Element type of a storage class such as `FloatStorage`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StorageKind {
    dtype: Option<DType>,
    element_size: usize,
}

impl StorageKind {
    fn from_class(class_name: &str) -> Result<Self> {
        let (dtype, element_size) = match class_name {
            "FloatStorage" => (Some(DType::F32), 4),
            "DoubleStorage" => (Some(DType::F64), 8),
            "HalfStorage" => (Some(DType::F16), 2),
            "BFloat16Storage" => (Some(DType::BF16), 2),
            "LongStorage" => (Some(DType::I64), 8),
            "IntStorage" => (Some(DType::I32), 4),
            "ShortStorage" => (Some(DType::I16), 2),
            "ByteStorage" | "BoolStorage" => (Some(DType::U8), 1),
            "CharStorage" => (None, 1),
            other => return Err(Error::checkpoint_format(format!("unsupported storage type {}", other))),
        };
        Ok(Self { dtype, element_size })
    }
}

/// A persistent storage id: `('storage', type, key, location, size, view)`
#[derive(Debug, Clone, PartialEq)]
struct StorageRef {
    key: String,
    kind: StorageKind,
    /// Element offset of a storage view inside its root storage
    view_offset: usize,
}

impl StorageRef {
    fn parse(id: &Object) -> Result<Self> {
        let fields = match id {
            Object::Tuple(fields) if fields.len() >= 5 => fields,
            other => return Err(unexpected("storage id tuple", other)),
        };
        match &fields[0] {
            Object::Unicode(tag) if tag == "storage" => {}
            other => return Err(unexpected("'storage' tag", other)),
        }
        let kind = match &fields[1] {
            Object::Class { class_name, .. } => StorageKind::from_class(class_name)?,
            other => return Err(unexpected("storage class", other)),
        };
        let key = match &fields[2] {
            Object::Unicode(key) => key.clone(),
            other => return Err(unexpected("storage key", other)),
        };
        let view_offset = match fields.get(5) {
            None | Some(Object::None) => 0,
            Some(Object::Tuple(view)) if view.len() == 3 => as_usize(&view[1])?,
            Some(other) => return Err(unexpected("storage view metadata", other)),
        };

        Ok(Self { key, kind, view_offset })
    }
}

/// Location of one storage inside the file
#[derive(Debug, Clone, Copy)]
struct StorageSlice {
    kind: StorageKind,
    /// Byte position of the first element
    start: usize,
    numel: usize,
}

/// Arguments of a tensor rebuild call
#[derive(Debug, Clone, PartialEq)]
struct RebuildArgs {
    storage: StorageRef,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

impl RebuildArgs {
    /// Recognize the tensor encodings used across torch versions; `None` for anything else.
    ///
    /// * `_rebuild_tensor_v2(storage, offset, size, stride, ...)` and `_rebuild_tensor(storage, offset, size, stride)`
    /// * `_rebuild_parameter(tensor, requires_grad, hooks)`
    /// * `FloatTensor()` followed by `BUILD (storage, offset, size, stride)` from the earliest releases
    fn parse(value: &Object) -> Result<Option<Self>> {
        match value {
            Object::Reduce { callable, args } => match (&**callable, &**args) {
                (Object::Class { module_name, class_name }, Object::Tuple(args))
                    if module_name == "torch._utils"
                        && (class_name == "_rebuild_tensor_v2" || class_name == "_rebuild_tensor") =>
                {
                    Self::from_args(args).map(Some)
                }
                (Object::Class { module_name, class_name }, Object::Tuple(args))
                    if module_name == "torch._utils" && class_name == "_rebuild_parameter" =>
                {
                    match args.first() {
                        Some(inner) => Self::parse(inner),
                        None => Err(unexpected("parameter tensor", value)),
                    }
                }
                _ => Ok(None),
            },
            Object::Build { callable, args } => match (&**callable, &**args) {
                (Object::Reduce { callable, .. }, Object::Tuple(args)) if is_tensor_class(callable) => {
                    Self::from_args(args).map(Some)
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn from_args(args: &[Object]) -> Result<Self> {
        if args.len() < 4 {
            return Err(Error::checkpoint_format(format!(
                "tensor rebuild takes at least 4 arguments, found {}",
                args.len()
            )));
        }
        let storage = match &args[0] {
            Object::PersistentLoad(id) => StorageRef::parse(id)?,
            other => return Err(unexpected("persistent storage id", other)),
        };

        Ok(Self {
            storage,
            offset: as_usize(&args[1])?,
            shape: as_dims(&args[2])?,
            stride: as_dims(&args[3])?,
        })
    }

    fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major layout; strides of size-1 dimensions are irrelevant
    fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.stride.len() {
            return false;
        }
        let mut expected = 1;
        for (&size, &stride) in self.shape.iter().zip(&self.stride).rev() {
            if size != 1 && stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    fn materialize(&self, name: &str, bytes: &[u8], storages: &HashMap<String, StorageSlice>) -> Result<Tensor> {
        let slice = storages
            .get(&self.storage.key)
            .ok_or_else(|| Error::checkpoint_format(format!("{}: storage '{}' has no data", name, self.storage.key)))?;
        let dtype = slice
            .kind
            .dtype
            .ok_or_else(|| Error::checkpoint_format(format!("{}: int8 tensors are not supported", name)))?;

        if !self.is_contiguous() {
            return Err(Error::checkpoint_format(format!(
                "{}: non-contiguous tensor (shape {:?}, stride {:?})",
                name, self.shape, self.stride
            )));
        }

        let first = self.storage.view_offset + self.offset;
        let numel = self.numel();
        if first + numel > slice.numel {
            return Err(Error::checkpoint_format(format!(
                "{}: elements {}..{} exceed storage of {}",
                name,
                first,
                first + numel,
                slice.numel
            )));
        }

        let start = slice.start + first * slice.kind.element_size;
        let end = start + numel * slice.kind.element_size;
        Ok(Tensor::from_raw_buffer(&bytes[start..end], dtype, &self.shape, &Device::Cpu)?)
    }
}

fn is_tensor_class(object: &Object) -> bool {
    matches!(object, Object::Class { module_name, class_name }
        if module_name == "torch" && class_name.ends_with("Tensor"))
}

/// Read the tensors stored in a legacy checkpoint.
///
/// `key` selects the entry of the saved dict that holds the state dict.
/// Entries that are not tensors (such as `_metadata`) are skipped.
pub fn read_all_with_key(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
    let bytes = std::fs::read(path)?;
    read_from_bytes(&bytes, key)
}

/// [`read_all_with_key`] over an in-memory file
pub fn read_from_bytes(bytes: &[u8], key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
    if !has_legacy_magic(bytes) {
        return Err(Error::checkpoint_format("missing legacy magic number"));
    }
    let mut cursor = Cursor::new(bytes);
    cursor.set_position(MAGIC_PICKLE_LEN as u64);

    let protocol = read_pickle(&mut cursor)?;
    match protocol {
        Object::Int(v) if v as i64 == PROTOCOL_VERSION => {}
        Object::Long(v) if v == PROTOCOL_VERSION => {}
        other => return Err(unexpected("protocol version 1001", &other)),
    }

    let sys_info = read_pickle(&mut cursor)?;
    check_sys_info(&sys_info)?;

    let object = read_pickle(&mut cursor)?;
    let storage_keys = match read_pickle(&mut cursor)? {
        Object::List(keys) => keys
            .into_iter()
            .map(|k| k.unicode().map_err(|other| unexpected("storage key", &other)))
            .collect::<Result<Vec<_>>>()?,
        other => return Err(unexpected("storage key list", &other)),
    };

    let mut kinds = HashMap::new();
    collect_storage_kinds(&object, &mut kinds)?;
    let storages = locate_storages(&mut cursor, &storage_keys, &kinds)?;
    debug!("Legacy checkpoint holds {} storages", storages.len());

    let state = select_entry(object, key)?;
    let entries = match state {
        Object::Dict(entries) => entries,
        other => return Err(unexpected("state dict", &other)),
    };

    let mut tensors = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        let name = match name {
            Object::Unicode(name) => name,
            _ => continue,
        };
        match RebuildArgs::parse(&value)? {
            Some(args) => {
                let tensor = args.materialize(&name, bytes, &storages)?;
                tensors.push((name, tensor));
            }
            None => debug!("Skipping non-tensor entry '{}'", name),
        }
    }

    Ok(tensors)
}

fn read_pickle(cursor: &mut Cursor<&[u8]>) -> Result<Object> {
    let mut stack = Stack::empty();
    stack
        .read_loop(cursor)
        .and_then(|_| stack.finalize())
        .map_err(|e| Error::checkpoint_format(format!("unreadable pickle: {}", e)))
}

fn check_sys_info(sys_info: &Object) -> Result<()> {
    let entries = match sys_info {
        Object::Dict(entries) => entries,
        other => return Err(unexpected("system info dict", other)),
    };
    let big_endian = entries.iter().any(|(k, v)| {
        matches!(k, Object::Unicode(k) if k == "little_endian") && matches!(v, Object::Bool(false))
    });
    if big_endian {
        return Err(Error::checkpoint_format("big-endian checkpoints are not supported"));
    }
    Ok(())
}

/// Record the storage class of every persistent id reachable from `object`
fn collect_storage_kinds(object: &Object, kinds: &mut HashMap<String, StorageKind>) -> Result<()> {
    match object {
        Object::PersistentLoad(id) => {
            let storage = StorageRef::parse(id)?;
            kinds.insert(storage.key, storage.kind);
        }
        Object::Tuple(items) | Object::List(items) => {
            for item in items {
                collect_storage_kinds(item, kinds)?;
            }
        }
        Object::Dict(entries) => {
            for (key, value) in entries {
                collect_storage_kinds(key, kinds)?;
                collect_storage_kinds(value, kinds)?;
            }
        }
        Object::Reduce { callable, args } | Object::Build { callable, args } => {
            collect_storage_kinds(callable, kinds)?;
            collect_storage_kinds(args, kinds)?;
        }
        _ => {}
    }
    Ok(())
}

/// Walk the storage section in key order
fn locate_storages(
    cursor: &mut Cursor<&[u8]>,
    keys: &[String],
    kinds: &HashMap<String, StorageKind>,
) -> Result<HashMap<String, StorageSlice>> {
    let total = cursor.get_ref().len();
    let mut storages = HashMap::with_capacity(keys.len());

    for key in keys {
        let kind = *kinds
            .get(key)
            .ok_or_else(|| Error::checkpoint_format(format!("storage '{}' is never referenced", key)))?;
        let numel = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::checkpoint_format(format!("truncated header for storage '{}'", key)))?
            as usize;

        let start = cursor.position() as usize;
        let end = numel
            .checked_mul(kind.element_size)
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end <= total)
            .ok_or_else(|| Error::checkpoint_format(format!("truncated data for storage '{}'", key)))?;

        storages.insert(key.clone(), StorageSlice { kind, start, numel });
        cursor.set_position(end as u64);
    }

    Ok(storages)
}

fn select_entry(object: Object, key: Option<&str>) -> Result<Object> {
    let key = match key {
        Some(key) => key,
        None => return Ok(object),
    };
    match object {
        Object::Dict(entries) => entries
            .into_iter()
            .find(|(k, _)| matches!(k, Object::Unicode(k) if k == key))
            .map(|(_, v)| v)
            .ok_or_else(|| Error::checkpoint_format(format!("no entry '{}' in checkpoint", key))),
        other => Err(unexpected(&format!("dict with entry '{}'", key), &other)),
    }
}

fn as_usize(object: &Object) -> Result<usize> {
    match object {
        Object::Int(v) if *v >= 0 => Ok(*v as usize),
        Object::Long(v) if *v >= 0 => Ok(*v as usize),
        other => Err(unexpected("non-negative integer", other)),
    }
}

fn as_dims(object: &Object) -> Result<Vec<usize>> {
    match object {
        Object::Tuple(items) | Object::List(items) => items.iter().map(as_usize).collect(),
        other => Err(unexpected("dimension tuple", other)),
    }
}

fn unexpected(what: &str, found: &Object) -> Error {
    let found = match found {
        Object::Class { module_name, class_name } => format!("class {}.{}", module_name, class_name),
        Object::Int(v) => format!("int {}", v),
        Object::Long(v) => format!("int {}", v),
        Object::Float(v) => format!("float {}", v),
        Object::Unicode(s) => format!("string '{}'", s),
        Object::Bool(b) => format!("bool {}", b),
        Object::None => "None".to_string(),
        Object::Tuple(items) => format!("tuple of {}", items.len()),
        Object::List(items) => format!("list of {}", items.len()),
        Object::Mark => "mark".to_string(),
        Object::Dict(entries) => format!("dict of {}", entries.len()),
        Object::Reduce { .. } => "reduce call".to_string(),
        Object::Build { .. } => "build call".to_string(),
        Object::PersistentLoad(_) => "persistent id".to_string(),
    };
    Error::checkpoint_format(format!("expected {}, found {}", what, found))
}
