use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use tensorvm_core::{
    fixed_dim::FixedDimensions,
    tensor::{Tensor, TensorData, TensorElemType},
};

use crate::VmError;

const MAGIC: &[u8] = b"\x93NUMPY";

fn descr(ty: TensorElemType) -> &'static str {
    match ty {
        TensorElemType::Bool => "|b1",
        TensorElemType::F32 => "<f4",
        TensorElemType::F64 => "<f8",
        TensorElemType::I32 => "<i4",
        TensorElemType::I64 => "<i8",
    }
}

fn header(tensor: &Tensor) -> Vec<u8> {
    let shape = match tensor.dims().as_slice() {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr(tensor.elem_ty()),
        shape
    );
    // Magic, version and length precede the header, which ends with '\n'.
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    header.extend(std::iter::repeat(' ').take((64 - unpadded % 64) % 64));
    header.push('\n');
    header.into_bytes()
}

/// Writes `tensor` as a version 1.0 `.npy` file.
pub fn save_npy(path: impl AsRef<Path>, tensor: &Tensor) -> Result<(), VmError> {
    let mut w = BufWriter::new(File::create(path)?);
    let header = header(tensor);
    let header_len = u16::try_from(header.len())
        .map_err(|_| VmError::Message("npy header is too long".into()))?;
    w.write_all(MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_all(&header_len.to_le_bytes())?;
    w.write_all(&header)?;
    match tensor.raw() {
        TensorData::Bool(v) => v.iter().try_for_each(|&x| w.write_all(&[x as u8]))?,
        TensorData::F32(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes()))?,
        TensorData::F64(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes()))?,
        TensorData::I32(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes()))?,
        TensorData::I64(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes()))?,
    }
    w.flush()?;
    Ok(())
}

/// Reads a C-ordered, little-endian `.npy` file written by `save_npy` or numpy.
pub fn load_npy(path: impl AsRef<Path>) -> Result<Tensor, VmError> {
    let malformed = |what: &str| VmError::Message(format!("Malformed npy: {what}").into());

    let mut r = BufReader::new(File::open(path)?);
    let mut preamble = [0u8; 10];
    r.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC || preamble[6] != 1 {
        return Err(malformed("magic or version"));
    }
    let header_len = u16::from_le_bytes([preamble[8], preamble[9]]) as usize;
    let mut header = vec![0u8; header_len];
    r.read_exact(&mut header)?;
    let header = String::from_utf8(header).map_err(|_| malformed("header"))?;

    fn field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
        let start = header.find(key)? + key.len();
        Some(header[start..].trim_start_matches(&[':', ' '][..]))
    }
    if field(&header, "'fortran_order'").map_or(true, |s| !s.starts_with("False")) {
        return Err(malformed("fortran order"));
    }
    let descr = field(&header, "'descr'")
        .and_then(|s| s.strip_prefix('\''))
        .and_then(|s| s.split('\'').next())
        .ok_or_else(|| malformed("descr"))?;
    let shape = field(&header, "'shape'")
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.split(')').next())
        .ok_or_else(|| malformed("shape"))?;
    let dims = shape
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| malformed("shape")))
        .collect::<Result<Vec<_>, _>>()?;
    let dims = FixedDimensions::from(dims);

    let mut body = vec![];
    r.read_to_end(&mut body)?;

    macro_rules! parse {
        ($ty:ty, $n:expr) => {{
            if body.len() != dims.total_elems() * $n {
                return Err(malformed("data size"));
            }
            let data = body
                .chunks_exact($n)
                .map(|c| {
                    let mut b = [0u8; $n];
                    b.copy_from_slice(c);
                    <$ty>::from_le_bytes(b)
                })
                .collect::<Vec<_>>();
            Tensor::new(dims, data)
        }};
    }

    Ok(match descr {
        "|b1" => {
            if body.len() != dims.total_elems() {
                return Err(malformed("data size"));
            }
            Tensor::new(dims, body.iter().map(|&b| b != 0).collect::<Vec<_>>())
        }
        "<f4" => parse!(f32, 4),
        "<f8" => parse!(f64, 8),
        "<i4" => parse!(i32, 4),
        "<i8" => parse!(i64, 8),
        _ => return Err(malformed("unsupported descr")),
    })
}

#[test]
fn header_is_aligned() {
    let t = Tensor::new(vec![2, 3].into(), vec![0.0f32; 6]);
    let h = header(&t);
    assert_eq!((MAGIC.len() + 4 + h.len()) % 64, 0);
    assert!(h.ends_with(b"\n"));
    assert!(String::from_utf8(h)
        .unwrap()
        .starts_with("{'descr': '<f4', 'fortran_order': False, 'shape': (2, 3), }"));
}

#[test]
fn save_and_load() {
    let dir = tempfile::tempdir().unwrap();

    let t = Tensor::new(vec![2, 2].into(), vec![1.0f32, -2.0, 3.5, 4.0]);
    let path = dir.path().join("a.npy");
    save_npy(&path, &t).unwrap();
    assert_eq!(load_npy(&path).unwrap(), t);

    let t = Tensor::new(vec![3].into(), vec![1i64, 2, 3]);
    let path = dir.path().join("b.npy");
    save_npy(&path, &t).unwrap();
    assert_eq!(load_npy(&path).unwrap(), t);

    let t = Tensor::scalar(true);
    let path = dir.path().join("c.npy");
    save_npy(&path, &t).unwrap();
    assert_eq!(load_npy(&path).unwrap(), t);
}
