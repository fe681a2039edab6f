//! Shared fixtures: tiny architectures, legacy parameter names, and torch checkpoint writers

#![allow(dead_code)]

use candle_core::Tensor;
use chexprep::DenseNetConfig;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;

pub fn tiny_architecture(num_classes: usize) -> DenseNetConfig {
    DenseNetConfig {
        growth_rate: 4,
        block_config: vec![2, 3],
        num_init_features: 8,
        bn_size: 2,
        num_classes,
    }
}

/// Turn current names into the legacy layout: nested `norm.1` and the `module.` prefix
pub fn legacy_name(name: &str) -> String {
    let nested = Regex::new(r"(denselayer\d+\.(?:norm|relu|conv))([12])\.").unwrap();
    format!("module.{}", nested.replace(name, "$1.$2."))
}

pub fn first_value(tensor: &Tensor) -> f32 {
    tensor.flatten_all().unwrap().get(0).unwrap().to_scalar::<f32>().unwrap()
}

/// One float tensor of a checkpoint's `state_dict`
#[derive(Debug, Clone)]
pub struct FixtureTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl FixtureTensor {
    pub fn filled(name: impl Into<String>, shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            values: vec![value; numel],
        }
    }
}

/// Elements stored ahead of every tensor so its storage offset is non-zero
const STORAGE_PAD: usize = 3;

/// Protocol 2 pickle writer emitting the opcodes Python's pickler uses for checkpoints
struct Pickler {
    out: Vec<u8>,
    memo: HashMap<(String, String), u8>,
}

impl Pickler {
    fn new() -> Self {
        Self {
            out: vec![0x80, 2],
            memo: HashMap::new(),
        }
    }

    fn op(&mut self, code: u8) -> &mut Self {
        self.out.push(code);
        self
    }

    fn global(&mut self, module: &str, name: &str) -> &mut Self {
        let key = (module.to_string(), name.to_string());
        if let Some(&slot) = self.memo.get(&key) {
            return self.op(b'h').op(slot);
        }
        let slot = self.memo.len() as u8;
        self.out.push(b'c');
        self.out.extend_from_slice(format!("{}\n{}\n", module, name).as_bytes());
        self.memo.insert(key, slot);
        self.op(b'q').op(slot)
    }

    fn text(&mut self, s: &str) -> &mut Self {
        self.out.push(b'X');
        self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
        self
    }

    fn int(&mut self, v: u32) -> &mut Self {
        if v < 0x100 {
            self.op(b'K').op(v as u8)
        } else if v < 0x10000 {
            self.out.push(b'M');
            self.out.extend_from_slice(&(v as u16).to_le_bytes());
            self
        } else {
            self.out.push(b'J');
            self.out.extend_from_slice(&(v as i32).to_le_bytes());
            self
        }
    }

    fn float(&mut self, v: f64) -> &mut Self {
        self.out.push(b'G');
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn long(&mut self, little_endian: &[u8]) -> &mut Self {
        self.op(0x8a).op(little_endian.len() as u8);
        self.out.extend_from_slice(little_endian);
        self
    }

    fn ints(&mut self, values: &[usize]) -> &mut Self {
        self.op(b'(');
        for &v in values {
            self.int(v as u32);
        }
        self.op(b't')
    }

    fn ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict").op(b')').op(b'R')
    }

    /// `_rebuild_tensor_v2(storage, offset, size, stride, False, OrderedDict())`
    fn tensor(&mut self, key: &str, numel: usize, shape: &[usize], legacy: bool) -> &mut Self {
        let mut stride = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * shape[i + 1];
        }

        self.global("torch._utils", "_rebuild_tensor_v2").op(b'(');
        self.op(b'(')
            .text("storage")
            .global("torch", "FloatStorage")
            .text(key)
            .text(if legacy { "cuda:0" } else { "cpu" })
            .int(numel as u32);
        if legacy {
            self.op(b'N');
        }
        self.op(b't').op(b'Q');
        self.int(STORAGE_PAD as u32).ints(shape).ints(&stride).op(0x89).ordered_dict();
        self.op(b't').op(b'R')
    }

    fn finish(&mut self) -> Vec<u8> {
        self.op(b'.');
        std::mem::take(&mut self.out)
    }
}

struct Storage {
    key: String,
    values: Vec<f32>,
}

impl Storage {
    fn bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// `{'epoch', 'arch', 'state_dict', 'best_loss', 'optimizer'}` as saved by a training script
fn checkpoint_object(tensors: &[FixtureTensor], legacy: bool) -> (Vec<u8>, Vec<Storage>) {
    let mut storages = vec![Storage {
        key: "0".to_string(),
        values: vec![7.0; 5],
    }];
    let mut p = Pickler::new();

    p.op(b'}').op(b'(');
    p.text("epoch").int(1);
    p.text("arch").text("densenet121");
    p.text("state_dict").ordered_dict().op(b'(');
    for (i, tensor) in tensors.iter().enumerate() {
        let key = (i + 1).to_string();
        let mut values = vec![-1.0; STORAGE_PAD];
        values.extend_from_slice(&tensor.values);
        p.text(&tensor.name).tensor(&key, values.len(), &tensor.shape, legacy);
        storages.push(Storage { key, values });
    }
    p.op(b'u');
    // state dicts carry their version metadata as instance state
    p.op(b'}').op(b'(').text("_metadata").ordered_dict().op(b'u').op(b'b');
    p.text("best_loss").float(0.25);
    p.text("optimizer").op(b'}').op(b'(').text("momentum_buffer");
    p.tensor("0", 5, &[2], legacy);
    p.op(b'u');
    p.op(b'u');

    (p.finish(), storages)
}

/// Write a checkpoint in the zip layout used by `torch.save` since PyTorch 1.6
pub fn write_zip_checkpoint(path: &Path, tensors: &[FixtureTensor]) {
    let (data, storages) = checkpoint_object(tensors, false);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let mut archive = zip::ZipWriter::new(File::create(path).unwrap());

    archive.start_file("archive/data.pkl", options).unwrap();
    archive.write_all(&data).unwrap();
    for storage in &storages {
        archive.start_file(format!("archive/data/{}", storage.key), options).unwrap();
        archive.write_all(&storage.bytes()).unwrap();
    }
    archive.start_file("archive/version", options).unwrap();
    archive.write_all(b"3\n").unwrap();
    archive.finish().unwrap();
}

/// Write a checkpoint in the pre-zip layout: magic, protocol, system info,
/// object and storage keys pickles, then every storage with its element count
pub fn write_legacy_checkpoint(path: &Path, tensors: &[FixtureTensor]) {
    let (data, mut storages) = checkpoint_object(tensors, true);
    storages.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out = Vec::new();
    out.extend(Pickler::new().long(&[0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19]).finish());
    out.extend(Pickler::new().int(1001).finish());

    let mut sys_info = Pickler::new();
    sys_info.op(b'}').op(b'(');
    sys_info.text("protocol_version").int(1001);
    sys_info.text("little_endian").op(0x88);
    sys_info.text("type_sizes").op(b'}').op(b'(');
    sys_info.text("short").int(2).text("int").int(4).text("long").int(4);
    sys_info.op(b'u').op(b'u');
    out.extend(sys_info.finish());

    out.extend(data);

    let mut keys = Pickler::new();
    keys.op(b']').op(b'(');
    for storage in &storages {
        keys.text(&storage.key);
    }
    keys.op(b'e');
    out.extend(keys.finish());

    for storage in &storages {
        out.extend_from_slice(&(storage.values.len() as u64).to_le_bytes());
        out.extend(storage.bytes());
    }

    File::create(path).unwrap().write_all(&out).unwrap();
}
