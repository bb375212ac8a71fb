//! Checkpoint loading (PyTorch zip checkpoints and safetensors)

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use candle_core::pickle::{Object, Stack};
use memmap2::Mmap;
use safetensors::SafeTensors;
use zip::ZipArchive;

use crate::error::{ModelError, Result};
use crate::tensor::{DType, Tensor, TensorMap};

/// Source container kind, decided from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `torch.save` zip archive (`.pth`, `.pt`, `.bin`, `.ckpt`)
    PyTorch,
    Safetensors,
}

impl CheckpointFormat {
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => CheckpointFormat::Safetensors,
            _ => CheckpointFormat::PyTorch,
        }
    }
}

/// Load every tensor of a checkpoint into memory
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<TensorMap> {
    let path = path.as_ref();

    if !path.is_file() {
        return Err(ModelError::ModelNotFound(path.display().to_string()));
    }

    tracing::info!("Loading checkpoint from {}", path.display());

    let tensors = match CheckpointFormat::detect(path) {
        CheckpointFormat::PyTorch => load_pytorch(path)?,
        CheckpointFormat::Safetensors => load_safetensors(path)?,
    };

    tracing::info!("Loaded {} tensors", tensors.len());
    Ok(tensors)
}

/// Read a `torch.save` zip archive holding a flat state dict
///
/// Every tensor entry of the pickled state dict is decoded, whatever its
/// storage type or strides. Entries that are not tensors are skipped.
pub fn load_pytorch(path: &Path) -> Result<TensorMap> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;

    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| {
            ModelError::InvalidFormat(format!("{}: no data.pkl in archive", path.display()))
        })?;
    let prefix = pickle_name.trim_end_matches("data.pkl").to_string();

    if let Ok(mut entry) = archive.by_name(&format!("{prefix}byteorder")) {
        let mut order = String::new();
        entry.read_to_string(&mut order)?;
        if order.trim() != "little" {
            return Err(ModelError::InvalidFormat(format!(
                "{}: {} byte order is not supported",
                path.display(),
                order.trim()
            )));
        }
    }

    let mut stack = Stack::empty();
    stack.read_loop(&mut BufReader::new(archive.by_name(&pickle_name)?))?;
    let entries = match stack.finalize()? {
        Object::Dict(entries) => entries,
        _ => {
            return Err(ModelError::InvalidFormat(format!(
                "{}: data.pkl does not hold a state dict",
                path.display()
            )));
        }
    };

    let mut storages: HashMap<String, Vec<u8>> = HashMap::new();
    let mut tensors = TensorMap::new();
    for (key, value) in entries {
        let Object::Unicode(name) = key else {
            continue;
        };
        let Some(stored) = StoredTensor::parse(&name, &value)? else {
            tracing::debug!("Skipping non-tensor entry {}", name);
            continue;
        };

        if !storages.contains_key(&stored.storage) {
            let bytes = read_entry(&mut archive, &format!("{prefix}data/{}", stored.storage))?;
            storages.insert(stored.storage.clone(), bytes);
        }
        let tensor = stored.gather(&name, &storages[&stored.storage])?;
        tracing::debug!("{}: {:?} {}", name, tensor.shape(), tensor.dtype());
        tensors.insert(name, tensor);
    }

    if tensors.is_empty() {
        return Err(ModelError::InvalidFormat(format!(
            "{}: no tensors found",
            path.display()
        )));
    }

    Ok(tensors)
}

/// Read every tensor of a safetensors file
pub fn load_safetensors(path: &Path) -> Result<TensorMap> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let safetensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| ModelError::InvalidFormat(format!("{}: {}", path.display(), e)))?;

    let mut tensors = TensorMap::new();
    for (name, view) in safetensors.tensors() {
        let dtype = DType::try_from(view.dtype())?;
        let tensor = Tensor::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
        tensors.insert(name, tensor);
    }

    Ok(tensors)
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Element type of a legacy `torch.*Storage` class
fn storage_dtype(class_name: &str) -> Option<DType> {
    let dtype = match class_name {
        "DoubleStorage" => DType::F64,
        "FloatStorage" => DType::F32,
        "HalfStorage" => DType::F16,
        "BFloat16Storage" => DType::BF16,
        "LongStorage" => DType::I64,
        "IntStorage" => DType::I32,
        "ShortStorage" => DType::I16,
        "CharStorage" => DType::I8,
        "ByteStorage" => DType::U8,
        "BoolStorage" => DType::Bool,
        _ => return None,
    };
    Some(dtype)
}

/// A tensor entry of `data.pkl`: a strided view into one storage record
#[derive(Debug, Clone, PartialEq)]
struct StoredTensor {
    storage: String,
    dtype: DType,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

impl StoredTensor {
    /// `Ok(None)` when `value` is not a tensor
    fn parse(name: &str, value: &Object) -> Result<Option<Self>> {
        let Object::Reduce { callable, args } = value else {
            return Ok(None);
        };
        let (Object::Class { class_name, .. }, Object::Tuple(args)) =
            (&**callable, &**args)
        else {
            return Ok(None);
        };

        match class_name.as_str() {
            "_rebuild_parameter" => match args.first() {
                Some(inner) => Self::parse(name, inner),
                None => Ok(None),
            },
            "_rebuild_tensor" | "_rebuild_tensor_v2" => Self::from_rebuild_args(name, args).map(Some),
            _ => Ok(None),
        }
    }

    fn from_rebuild_args(name: &str, args: &[Object]) -> Result<Self> {
        let malformed =
            || ModelError::InvalidFormat(format!("{name}: unexpected tensor record in data.pkl"));

        let [Object::PersistentLoad(id), offset, shape, stride, ..] = args else {
            return Err(malformed());
        };
        let Object::Tuple(id) = &**id else {
            return Err(malformed());
        };
        let [_, Object::Class { class_name, .. }, Object::Unicode(storage), ..] = id.as_slice()
        else {
            return Err(malformed());
        };

        let dtype = storage_dtype(class_name)
            .ok_or_else(|| ModelError::UnsupportedDtype(format!("{name}: {class_name}")))?;
        let offset = to_usize(offset).ok_or_else(malformed)?;
        let shape = to_usize_tuple(shape).ok_or_else(malformed)?;
        let stride = to_usize_tuple(stride).ok_or_else(malformed)?;
        if shape.len() != stride.len() {
            return Err(malformed());
        }

        Ok(Self {
            storage: storage.clone(),
            dtype,
            offset,
            shape,
            stride,
        })
    }

    fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(&self.stride).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// Copy the viewed elements out of `storage` in row-major order
    fn gather(&self, name: &str, storage: &[u8]) -> Result<Tensor> {
        let size = self.dtype.size_bytes();
        let numel: usize = self.shape.iter().product();
        let out_of_bounds = || {
            ModelError::InvalidFormat(format!(
                "{name}: view {:?} / {:?} at offset {} exceeds its storage",
                self.shape, self.stride, self.offset
            ))
        };

        if self.is_contiguous() {
            let start = self.offset * size;
            let bytes = storage
                .get(start..start + numel * size)
                .ok_or_else(out_of_bounds)?;
            return Tensor::new(self.shape.clone(), self.dtype, bytes.to_vec());
        }

        let mut data = Vec::with_capacity(numel * size);
        let mut index = vec![0usize; self.shape.len()];
        for _ in 0..numel {
            let element = self.offset
                + index
                    .iter()
                    .zip(&self.stride)
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            let start = element * size;
            let bytes = storage.get(start..start + size).ok_or_else(out_of_bounds)?;
            data.extend_from_slice(bytes);

            for dim in (0..index.len()).rev() {
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }

        Tensor::new(self.shape.clone(), self.dtype, data)
    }
}

fn to_usize(value: &Object) -> Option<usize> {
    match value {
        Object::Int(v) => usize::try_from(*v).ok(),
        _ => None,
    }
}

fn to_usize_tuple(value: &Object) -> Option<Vec<usize>> {
    match value {
        Object::Tuple(items) => items.iter().map(to_usize).collect(),
        _ => None,
    }
}
