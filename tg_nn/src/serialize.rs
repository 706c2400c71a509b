//! Parameter persistence.
//!
//! Parameters are written as a concatenation of records: the element count
//! as a little-endian u64, then the raw little-endian payload of
//! `count * dtype_size` bytes. Loading walks the module's parameters in the
//! same order and refuses a record whose count differs from the in-memory
//! parameter.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tg_tensor::prelude::*;

use crate::module::Module;

pub fn save(module: &dyn Module, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path)?;
    for param in module.parameters() {
        let value = param.value();
        let count = value.size() as u64;
        file.write_all(&count.to_le_bytes())?;
        file.write_all(value.raw_bytes())?;
    }
    Ok(())
}

pub fn load(module: &dyn Module, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::open(path)?;
    for param in module.parameters() {
        let mut count_bytes = [0u8; 8];
        file.read_exact(&mut count_bytes)?;
        let count = u64::from_le_bytes(count_bytes) as usize;

        let mut value = param.value_mut();
        if count != value.size() {
            return Err(TensorError::ShapeMismatch(format!(
                "stored parameter has {count} elements, expected {}",
                value.size()
            )));
        }
        file.read_exact(value.raw_bytes_mut())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;

    #[test]
    fn test_save_load_round_trip() {
        let path = std::env::temp_dir().join("tg_nn_serialize_round_trip.bin");

        let source = Linear::new(3, 2);
        save(&source, &path).unwrap();

        let target = Linear::new(3, 2);
        load(&target, &path).unwrap();

        let sw = source.weight.to_vec::<f32>().unwrap();
        let tw = target.weight.to_vec::<f32>().unwrap();
        assert_eq!(sw, tw);
        let sb = source.bias.to_vec::<f32>().unwrap();
        let tb = target.bias.to_vec::<f32>().unwrap();
        assert_eq!(sb, tb);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let path = std::env::temp_dir().join("tg_nn_serialize_mismatch.bin");

        let source = Linear::new(3, 2);
        save(&source, &path).unwrap();

        let target = Linear::new(4, 2);
        assert!(matches!(
            load(&target, &path),
            Err(TensorError::ShapeMismatch(_))
        ));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_io_failure() {
        let model = Linear::new(2, 2);
        let missing = std::env::temp_dir().join("tg_nn_serialize_does_not_exist.bin");
        assert!(matches!(
            load(&model, &missing),
            Err(TensorError::IoFailure(_))
        ));
    }
}
