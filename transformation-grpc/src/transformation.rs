//! On-demand transformations: named, pure functions from one batch of
//! input rows to a batch of derived feature columns.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::TransformError;

/// A registered on-demand transformation.
///
/// Implementations must be re-entrant: the same instance is invoked from
/// many worker threads at once and may not keep mutable state between calls.
pub trait Transformation: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Declared schema of the derived columns returned by [`transform`](Self::transform).
    fn output_schema(&self) -> SchemaRef;

    /// Compute the derived columns for every input row.
    ///
    /// The returned batch holds only the derived columns, one row per input row.
    fn transform(&self, input: &RecordBatch) -> Result<RecordBatch, TransformError>;
}

type TransformFn = dyn Fn(&RecordBatch) -> Result<RecordBatch, TransformError> + Send + Sync;

/// Closure-backed transformation.
pub struct FnTransformation {
    name: String,
    output_schema: SchemaRef,
    func: Box<TransformFn>,
}

impl FnTransformation {
    pub fn new<F>(name: impl Into<String>, output_schema: SchemaRef, func: F) -> Self
    where
        F: Fn(&RecordBatch) -> Result<RecordBatch, TransformError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            output_schema,
            func: Box::new(func),
        }
    }
}

impl Transformation for FnTransformation {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    fn transform(&self, input: &RecordBatch) -> Result<RecordBatch, TransformError> {
        (self.func)(input)
    }
}

impl fmt::Debug for FnTransformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransformation")
            .field("name", &self.name)
            .field("output_schema", &self.output_schema)
            .finish_non_exhaustive()
    }
}

/// Look up a column by name and downcast it to the expected array type.
pub fn column_as<'a, A: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
    expected: DataType,
) -> Result<&'a A, TransformError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| TransformError::MissingColumn(name.to_string()))?;

    column
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| TransformError::TypeMismatch {
            column: name.to_string(),
            expected,
            actual: column.data_type().clone(),
        })
}

// ─── Built-in transformations ───

pub const CONV_RATE_TRANSFORM: &str = "conv_rate_transform";

/// `conv_rate = conversions / trips`.
///
/// Null when either input is null or `trips` is zero.
pub fn conv_rate_transform() -> FnTransformation {
    let output_schema = Arc::new(Schema::new(vec![Field::new(
        "conv_rate",
        DataType::Float64,
        true,
    )]));
    let schema = Arc::clone(&output_schema);

    FnTransformation::new(CONV_RATE_TRANSFORM, output_schema, move |input| {
        let trips = column_as::<Int64Array>(input, "trips", DataType::Int64)?;
        let conversions = column_as::<Int64Array>(input, "conversions", DataType::Int64)?;

        let conv_rate: Float64Array = trips
            .iter()
            .zip(conversions.iter())
            .map(|(trips, conversions)| match (trips, conversions) {
                (Some(t), Some(c)) if t != 0 => Some(c as f64 / t as f64),
                _ => None,
            })
            .collect();

        let columns: Vec<ArrayRef> = vec![Arc::new(conv_rate)];
        Ok(RecordBatch::try_new(Arc::clone(&schema), columns)?)
    })
}
