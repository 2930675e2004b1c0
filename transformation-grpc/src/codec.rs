//! Arrow IPC file-format codec for transformation inputs and outputs.
//!
//! The payload is self-describing: the schema message travels in the same
//! buffer as the record batches, so decoding needs no side-channel schema.

use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};

use arrow::compute::concat_batches;
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::ipc::{root_as_footer, Block};
use arrow::record_batch::RecordBatch;

use crate::error::CodecError;

const IPC_FILE_OVERHEAD_BYTES: usize = 2048;

const ARROW_MAGIC: &[u8] = b"ARROW1";
/// Leading magic plus padding to 8 bytes.
const FILE_HEADER_LEN: usize = 8;
/// Footer length (i32) plus trailing magic.
const FILE_TRAILER_LEN: usize = 4 + ARROW_MAGIC.len();

fn estimate_ipc_capacity(batch: &RecordBatch) -> usize {
    batch
        .get_array_memory_size()
        .saturating_add(IPC_FILE_OVERHEAD_BYTES)
}

/// Decode an Arrow IPC file into a single batch.
///
/// A file holding several record batches is concatenated in order. A file
/// holding none yields an empty batch with the file's schema.
pub fn decode(bytes: &[u8]) -> Result<RecordBatch, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    check_file_layout(bytes).map_err(CodecError::Decode)?;

    // Block extents are checked above; offsets inside a block are not, and
    // the reader panics on inconsistent ones.
    match catch_unwind(AssertUnwindSafe(|| read_file(bytes))) {
        Ok(result) => result.map_err(CodecError::Decode),
        Err(_) => Err(CodecError::Decode(ArrowError::IpcError(
            "Arrow IPC reader aborted on malformed input".to_string(),
        ))),
    }
}

/// Validate the file framing and every footer block against the buffer.
///
/// The reader allocates each block from its declared lengths, so a block
/// reaching past the footer, or overlapping another block, is rejected here.
fn check_file_layout(bytes: &[u8]) -> Result<(), ArrowError> {
    let invalid = |msg: &str| ArrowError::ParseError(format!("invalid Arrow IPC file: {msg}"));

    if bytes.len() < FILE_HEADER_LEN + FILE_TRAILER_LEN
        || !bytes.starts_with(ARROW_MAGIC)
        || !bytes.ends_with(ARROW_MAGIC)
    {
        return Err(invalid("missing ARROW1 magic"));
    }

    let trailer = bytes.len() - FILE_TRAILER_LEN;
    let mut footer_len = [0u8; 4];
    footer_len.copy_from_slice(&bytes[trailer..trailer + 4]);
    let footer_len = usize::try_from(i32::from_le_bytes(footer_len))
        .map_err(|_| invalid("negative footer length"))?;
    let footer_start = trailer
        .checked_sub(footer_len)
        .filter(|start| *start >= FILE_HEADER_LEN)
        .ok_or_else(|| invalid("footer length exceeds file"))?;

    let footer = root_as_footer(&bytes[footer_start..trailer])
        .map_err(|e| invalid(&format!("footer: {e}")))?;

    let mut extents = Vec::new();
    for blocks in [footer.dictionaries(), footer.recordBatches()].into_iter().flatten() {
        for block in blocks.iter() {
            let extent = block_extent(block, footer_start)
                .ok_or_else(|| invalid("block extends outside the file body"))?;
            extents.push(extent);
        }
    }

    extents.sort_unstable();
    if extents.windows(2).any(|pair| pair[0].1 > pair[1].0) {
        return Err(invalid("overlapping blocks"));
    }
    Ok(())
}

/// `[start, end)` of a block, if it lies between the header and the footer.
fn block_extent(block: &Block, footer_start: usize) -> Option<(usize, usize)> {
    let start = usize::try_from(block.offset()).ok()?;
    let meta = usize::try_from(block.metaDataLength()).ok()?;
    let body = usize::try_from(block.bodyLength()).ok()?;
    let end = start.checked_add(meta)?.checked_add(body)?;
    (start >= FILE_HEADER_LEN && end <= footer_start).then_some((start, end))
}

fn read_file(bytes: &[u8]) -> Result<RecordBatch, ArrowError> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)?;
    let schema = reader.schema();

    let mut batches = reader.collect::<Result<Vec<_>, _>>()?;
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.swap_remove(0)),
        _ => concat_batches(&schema, &batches),
    }
}

/// Encode a batch as an Arrow IPC file: schema, one record batch, footer.
pub fn encode(batch: &RecordBatch) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(estimate_ipc_capacity(batch));
    {
        let mut writer =
            FileWriter::try_new(&mut buf, batch.schema().as_ref()).map_err(CodecError::Encode)?;
        writer.write(batch).map_err(CodecError::Encode)?;
        writer.finish().map_err(CodecError::Encode)?;
    }
    Ok(buf)
}
