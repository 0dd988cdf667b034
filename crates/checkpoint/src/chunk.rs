//! Copying rectangular chunks between a global tensor and contiguous buffers

use runtime_core::types::checked_nbytes;
use runtime_core::{Error, Result, Tensor};

use crate::metadata::ChunkStorageMetadata;

/// Visit every contiguous run (one innermost row) of a chunk
///
/// `f` receives the byte offset in the global tensor, the byte offset in the
/// chunk buffer, and the run length in bytes. Bounds must already be checked.
fn for_each_run<F>(global: &[usize], chunk: &ChunkStorageMetadata, elem: usize, mut f: F)
where
    F: FnMut(usize, usize, usize),
{
    let ndim = global.len();
    if ndim == 0 {
        f(0, 0, elem);
        return;
    }
    if chunk.sizes.iter().any(|&s| s == 0) {
        return;
    }

    let mut strides = vec![1usize; ndim];
    for d in (0..ndim - 1).rev() {
        strides[d] = strides[d + 1] * global[d + 1];
    }

    let run_bytes = chunk.sizes[ndim - 1] * elem;
    let outer = &chunk.sizes[..ndim - 1];
    let runs: usize = outer.iter().product();
    let mut index = vec![0usize; ndim - 1];

    for run in 0..runs {
        let global_elem: usize = index
            .iter()
            .enumerate()
            .map(|(d, &i)| (chunk.offsets[d] + i) * strides[d])
            .sum::<usize>()
            + chunk.offsets[ndim - 1];
        f(global_elem * elem, run * run_bytes, run_bytes);

        for d in (0..ndim - 1).rev() {
            index[d] += 1;
            if index[d] < outer[d] {
                break;
            }
            index[d] = 0;
        }
    }
}

fn check_chunk(fqn: &str, tensor: &Tensor, chunk: &ChunkStorageMetadata) -> Result<usize> {
    let shape = tensor.shape();
    let fits = chunk.offsets.len() == shape.len()
        && chunk.sizes.len() == shape.len()
        && chunk
            .offsets
            .iter()
            .zip(&chunk.sizes)
            .zip(shape)
            .all(|((&off, &len), &dim)| off.checked_add(len).is_some_and(|end| end <= dim));
    if !fits {
        return Err(Error::ShapeMismatch {
            fqn: fqn.to_string(),
            expected: shape.to_vec(),
            actual: chunk.sizes.clone(),
        });
    }

    checked_nbytes(&chunk.sizes, tensor.dtype()).ok_or_else(|| Error::Internal {
        message: format!("{}: chunk size overflows", fqn),
    })
}

/// Copy a contiguous chunk buffer into its place in `tensor`
pub fn copy_chunk_into(
    fqn: &str,
    tensor: &mut Tensor,
    chunk: &ChunkStorageMetadata,
    src: &[u8],
) -> Result<()> {
    let expected = check_chunk(fqn, tensor, chunk)?;
    if src.len() != expected {
        return Err(Error::CheckpointCorrupted {
            path: fqn.to_string(),
            reason: format!(
                "chunk at {:?} has {} bytes, expected {}",
                chunk.offsets,
                src.len(),
                expected
            ),
        });
    }

    let elem = tensor.dtype().element_size();
    let shape = tensor.shape().to_vec();
    let dst = tensor.as_bytes_mut();
    for_each_run(&shape, chunk, elem, |global, local, len| {
        dst[global..global + len].copy_from_slice(&src[local..local + len]);
    });
    Ok(())
}

/// Gather the elements of `chunk` from `tensor` into a contiguous buffer
pub fn extract_chunk(fqn: &str, tensor: &Tensor, chunk: &ChunkStorageMetadata) -> Result<Vec<u8>> {
    let nbytes = check_chunk(fqn, tensor, chunk)?;

    let mut out = vec![0u8; nbytes];
    let src = tensor.as_bytes();
    for_each_run(tensor.shape(), chunk, tensor.dtype().element_size(), |global, local, len| {
        out[local..local + len].copy_from_slice(&src[global..global + len]);
    });
    Ok(out)
}
