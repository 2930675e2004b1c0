//! Bounded execution pool for transformation invocations.
//!
//! Admission is a semaphore of `max_workers` permits. A request that cannot
//! get a permit waits in line; when `max_queue_depth` is set and the line is
//! already that long, it is turned away with [`ExecutionError::Overloaded`].
//! Each admitted invocation runs on the blocking thread pool, so a slow or
//! panicking transformation never stalls the async request intake.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arrow::array::ArrayRef;
use arrow::datatypes::{FieldRef, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::transformation::Transformation;

/// Worker budget and queueing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent transformation invocations.
    pub max_workers: usize,
    /// Maximum requests waiting for a worker; `None` queues without limit.
    pub max_queue_depth: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_queue_depth: None,
        }
    }
}

/// Per-request output shaping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Return input columns joined with the derived columns.
    pub full_output: bool,
    /// Prefix derived column names with `<transformation>__`.
    pub full_feature_names: bool,
}

struct Inner {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<Inner>,
}

/// Held while waiting for a permit; leaves the line on drop, including
/// when the caller gives up on the request.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Held by the worker for the duration of one invocation.
struct WorkerSlot {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ExecutionPool {
    pub fn new(config: PoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            inner: Arc::new(Inner {
                config: PoolConfig {
                    max_workers,
                    ..config
                },
                permits: Arc::new(Semaphore::new(max_workers)),
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Invocations currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Requests waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// Stop admitting work. Queued and future requests fail with
    /// [`ExecutionError::PoolClosed`]; running invocations finish.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Run `transformation` over `input` on a pool worker.
    pub async fn run(
        &self,
        transformation: Arc<dyn Transformation>,
        input: RecordBatch,
        options: ExecutionOptions,
    ) -> Result<RecordBatch, ExecutionError> {
        let permit = self.acquire().await?;
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = WorkerSlot {
            inner: Arc::clone(&self.inner),
            _permit: permit,
        };

        let name = transformation.name().to_string();
        let handle = task::spawn_blocking(move || {
            let _slot = slot;
            execute(transformation.as_ref(), &input, options)
        });

        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                warn!(transformation = %name, %message, "Transformation panicked");
                Err(ExecutionError::Panicked { name, message })
            }
            Err(_) => Err(ExecutionError::PoolClosed),
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ExecutionError> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(ExecutionError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let ahead = self.inner.queued.fetch_add(1, Ordering::AcqRel);
        let _slot = QueueSlot(&self.inner.queued);
        if let Some(max) = self.inner.config.max_queue_depth {
            if ahead >= max {
                return Err(ExecutionError::Overloaded { queued: ahead });
            }
        }

        debug!(queued = ahead + 1, "Waiting for execution worker");
        Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::PoolClosed)
    }
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

fn execute(
    transformation: &dyn Transformation,
    input: &RecordBatch,
    options: ExecutionOptions,
) -> Result<RecordBatch, ExecutionError> {
    let name = transformation.name();
    let started = Instant::now();

    let derived = transformation
        .transform(input)
        .map_err(|source| ExecutionError::Transform {
            name: name.to_string(),
            source,
        })?;

    check_contract(transformation, input, &derived).map_err(|reason| {
        ExecutionError::ContractViolation {
            name: name.to_string(),
            reason,
        }
    })?;

    let output = shape_output(name, input, derived, options).map_err(|e| {
        ExecutionError::ContractViolation {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;

    debug!(
        transformation = name,
        rows = output.num_rows(),
        columns = output.num_columns(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "Transformation executed"
    );
    Ok(output)
}

/// Derived batch must have one row per input row and match the declared schema.
fn check_contract(
    transformation: &dyn Transformation,
    input: &RecordBatch,
    derived: &RecordBatch,
) -> Result<(), String> {
    if derived.num_rows() != input.num_rows() {
        return Err(format!(
            "returned {} rows for {} input rows",
            derived.num_rows(),
            input.num_rows()
        ));
    }

    let declared = transformation.output_schema();
    let actual = derived.schema();
    if declared.fields().len() != actual.fields().len() {
        return Err(format!(
            "returned {} columns, declared {}",
            actual.fields().len(),
            declared.fields().len()
        ));
    }

    for (want, got) in declared.fields().iter().zip(actual.fields().iter()) {
        if want.name() != got.name() || want.data_type() != got.data_type() {
            return Err(format!(
                "returned column {}: {}, declared {}: {}",
                got.name(),
                got.data_type(),
                want.name(),
                want.data_type()
            ));
        }
    }
    Ok(())
}

/// Apply feature naming and the full-output join.
///
/// With `full_output`, input columns keep their order and derived columns
/// follow; a derived column named like an input column replaces it in place.
fn shape_output(
    name: &str,
    input: &RecordBatch,
    derived: RecordBatch,
    options: ExecutionOptions,
) -> Result<RecordBatch, arrow::error::ArrowError> {
    let derived_fields: Vec<FieldRef> = derived
        .schema()
        .fields()
        .iter()
        .map(|field| {
            if options.full_feature_names {
                Arc::new(field.as_ref().clone().with_name(format!("{name}__{}", field.name())))
            } else {
                Arc::clone(field)
            }
        })
        .collect();

    let (fields, columns, metadata): (Vec<FieldRef>, Vec<ArrayRef>, _) = if options.full_output {
        let input_schema = input.schema();
        let mut fields: Vec<FieldRef> = input_schema.fields().iter().cloned().collect();
        let mut columns: Vec<ArrayRef> = input.columns().to_vec();

        for (field, column) in derived_fields.into_iter().zip(derived.columns().iter()) {
            match fields.iter().position(|f| f.name() == field.name()) {
                Some(idx) => {
                    fields[idx] = field;
                    columns[idx] = Arc::clone(column);
                }
                None => {
                    fields.push(field);
                    columns.push(Arc::clone(column));
                }
            }
        }
        (fields, columns, input_schema.metadata().clone())
    } else {
        (
            derived_fields,
            derived.columns().to_vec(),
            derived.schema().metadata().clone(),
        )
    };

    let schema = Arc::new(Schema::new_with_metadata(fields, metadata));
    let options = RecordBatchOptions::new().with_row_count(Some(input.num_rows()));
    RecordBatch::try_new_with_options(schema, columns, &options)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::transformation::{conv_rate_transform, FnTransformation};
    use arrow::array::{Array, Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field};
    use std::time::Duration;

    fn driver_batch(ids: Vec<i64>, trips: Vec<i64>, conversions: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("driver_id", DataType::Int64, false),
            Field::new("trips", DataType::Int64, true),
            Field::new("conversions", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(trips)),
                Arc::new(Int64Array::from(conversions)),
            ],
        )
        .unwrap()
    }

    fn column_names(batch: &RecordBatch) -> Vec<String> {
        batch.schema().fields().iter().map(|f| f.name().clone()).collect()
    }

    fn conv_rate() -> Arc<dyn Transformation> {
        Arc::new(conv_rate_transform())
    }

    #[tokio::test]
    async fn test_derived_only_output() {
        let pool = ExecutionPool::default();
        let output = pool
            .run(conv_rate(), driver_batch(vec![1], vec![10], vec![3]), ExecutionOptions::default())
            .await
            .unwrap();

        assert_eq!(column_names(&output), vec!["conv_rate"]);
    }

    #[tokio::test]
    async fn test_full_output_joins_input() {
        let pool = ExecutionPool::default();
        let options = ExecutionOptions {
            full_output: true,
            ..Default::default()
        };
        let output = pool
            .run(conv_rate(), driver_batch(vec![5001], vec![10], vec![3]), options)
            .await
            .unwrap();

        assert_eq!(
            column_names(&output),
            vec!["driver_id", "trips", "conversions", "conv_rate"]
        );
        let rate = output
            .column(3)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(rate.value(0), 0.3);
    }

    #[tokio::test]
    async fn test_full_feature_names_prefix() {
        let pool = ExecutionPool::default();
        let options = ExecutionOptions {
            full_output: true,
            full_feature_names: true,
        };
        let output = pool
            .run(conv_rate(), driver_batch(vec![1], vec![2], vec![1]), options)
            .await
            .unwrap();

        assert_eq!(
            column_names(&output),
            vec!["driver_id", "trips", "conversions", "conv_rate_transform__conv_rate"]
        );
    }

    #[tokio::test]
    async fn test_derived_column_replaces_input_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("trips", DataType::Int64, true)]));
        let out = Arc::clone(&schema);
        let doubler = FnTransformation::new("double_trips", schema, move |input| {
            let trips = input
                .column_by_name("trips")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| TransformError::MissingColumn("trips".into()))?;
            let doubled: Int64Array = trips.iter().map(|v| v.map(|v| v * 2)).collect();
            Ok(RecordBatch::try_new(Arc::clone(&out), vec![Arc::new(doubled)])?)
        });

        let options = ExecutionOptions {
            full_output: true,
            ..Default::default()
        };
        let output = ExecutionPool::default()
            .run(Arc::new(doubler), driver_batch(vec![1, 2], vec![3, 4], vec![0, 0]), options)
            .await
            .unwrap();

        assert_eq!(column_names(&output), vec!["driver_id", "trips", "conversions"]);
        let trips = output
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(trips.values().to_vec(), vec![6, 8]);
    }

    #[tokio::test]
    async fn test_transform_error_is_typed() {
        let schema = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)]));
        let failing = FnTransformation::new("failing", schema, |_| {
            Err(TransformError::Failed("upstream feature context unavailable".into()))
        });

        let err = ExecutionPool::default()
            .run(Arc::new(failing), driver_batch(vec![1], vec![1], vec![1]), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Transform { ref name, .. } if name == "failing"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let schema = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)]));
        let panicking = FnTransformation::new("panicking", schema, |_| panic!("division by zero"));

        let pool = ExecutionPool::new(PoolConfig {
            max_workers: 1,
            max_queue_depth: None,
        });
        let err = pool
            .run(Arc::new(panicking), driver_batch(vec![1], vec![1], vec![1]), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Panicked { ref message, .. } if message == "division by zero"));

        // The single worker is released and usable again
        assert_eq!(pool.in_flight(), 0);
        let output = pool
            .run(conv_rate(), driver_batch(vec![1], vec![4], vec![1]), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(output.num_rows(), 1);
    }

    #[tokio::test]
    async fn test_row_count_contract() {
        let schema = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)]));
        let out = Arc::clone(&schema);
        let short = FnTransformation::new("short", schema, move |_| {
            Ok(RecordBatch::try_new(
                Arc::clone(&out),
                vec![Arc::new(Int64Array::from(vec![1]))],
            )?)
        });

        let err = ExecutionPool::default()
            .run(Arc::new(short), driver_batch(vec![1, 2], vec![1, 1], vec![1, 1]), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ContractViolation { .. }));
    }

    #[tokio::test]
    async fn test_declared_schema_contract() {
        let declared = Arc::new(Schema::new(vec![Field::new("y", DataType::Float64, true)]));
        let actual = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)]));
        let lying = FnTransformation::new("lying", declared, move |_| {
            Ok(RecordBatch::try_new(
                Arc::clone(&actual),
                vec![Arc::new(Int64Array::from(vec![1]))],
            )?)
        });

        let err = ExecutionPool::default()
            .run(Arc::new(lying), driver_batch(vec![1], vec![1], vec![1]), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ContractViolation { ref name, .. } if name == "lying"));
    }

    fn sleeper(millis: u64) -> Arc<dyn Transformation> {
        let schema = Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)]));
        let out = Arc::clone(&schema);
        Arc::new(FnTransformation::new("sleeper", schema, move |input| {
            std::thread::sleep(Duration::from_millis(millis));
            let ys: Int64Array = (0..input.num_rows() as i64).map(Some).collect();
            Ok(RecordBatch::try_new(Arc::clone(&out), vec![Arc::new(ys)])?)
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_depth_limit() {
        let pool = ExecutionPool::new(PoolConfig {
            max_workers: 1,
            max_queue_depth: Some(1),
        });
        let input = driver_batch(vec![1], vec![1], vec![1]);

        let running = {
            let pool = pool.clone();
            let input = input.clone();
            tokio::spawn(async move { pool.run(sleeper(300), input, ExecutionOptions::default()).await })
        };
        while pool.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let waiting = {
            let pool = pool.clone();
            let input = input.clone();
            tokio::spawn(async move { pool.run(sleeper(1), input, ExecutionOptions::default()).await })
        };
        while pool.queued() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let rejected = pool
            .run(sleeper(1), input, ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(rejected, ExecutionError::Overloaded { queued: 1 }));

        assert!(running.await.unwrap().is_ok());
        assert!(waiting.await.unwrap().is_ok());
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = ExecutionPool::default();
        pool.close();
        let err = pool
            .run(conv_rate(), driver_batch(vec![1], vec![1], vec![1]), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PoolClosed));
    }
}
