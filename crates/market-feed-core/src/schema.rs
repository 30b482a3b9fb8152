use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::StoreError;

const DECIMAL_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Timestamp in UTC microseconds followed by the five decimal columns,
/// stored as strings so no precision is lost.
pub fn candle_schema() -> Schema {
    let mut fields = vec![Field::new(
        "timestamp",
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    )];
    fields.extend(
        DECIMAL_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Utf8, false)),
    );
    Schema::new(fields)
}

fn decimal_column(candles: &[Candle], pick: fn(&Candle) -> Decimal) -> ArrayRef {
    let values: Vec<String> = candles.iter().map(|c| pick(c).to_string()).collect();
    Arc::new(StringArray::from_iter_values(values))
}

pub fn candles_to_record_batch(candles: &[Candle]) -> Result<RecordBatch, StoreError> {
    let timestamps: Vec<i64> = candles
        .iter()
        .map(|c| c.timestamp.timestamp_micros())
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone("UTC")),
        decimal_column(candles, |c| c.open),
        decimal_column(candles, |c| c.high),
        decimal_column(candles, |c| c.low),
        decimal_column(candles, |c| c.close),
        decimal_column(candles, |c| c.volume),
    ];

    Ok(RecordBatch::try_new(Arc::new(candle_schema()), columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, StoreError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| StoreError::InvalidData(format!("expected {name} column")))
}

fn parse_decimal(column: &StringArray, row: usize, name: &str) -> Result<Decimal, StoreError> {
    column
        .value(row)
        .parse()
        .map_err(|e| StoreError::InvalidData(format!("invalid {name} at row {row}: {e}")))
}

pub fn record_batch_to_candles(batch: &RecordBatch) -> Result<Vec<Candle>, StoreError> {
    let timestamps = batch
        .column_by_name("timestamp")
        .and_then(|col| col.as_any().downcast_ref::<TimestampMicrosecondArray>())
        .ok_or_else(|| StoreError::InvalidData("expected timestamp column".into()))?;

    let [opens, highs, lows, closes, volumes] = [
        string_column(batch, "open")?,
        string_column(batch, "high")?,
        string_column(batch, "low")?,
        string_column(batch, "close")?,
        string_column(batch, "volume")?,
    ];

    let mut candles = Vec::with_capacity(timestamps.len());
    for i in 0..batch.num_rows() {
        let micros = timestamps.value(i);
        let timestamp = chrono::DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| StoreError::InvalidData(format!("invalid timestamp: {micros}")))?;

        candles.push(Candle {
            timestamp,
            open: parse_decimal(opens, i, "open")?,
            high: parse_decimal(highs, i, "high")?,
            low: parse_decimal(lows, i, "low")?,
            close: parse_decimal(closes, i, "close")?,
            volume: parse_decimal(volumes, i, "volume")?,
        });
    }

    Ok(candles)
}

/// Write candles to `path` in one row group.
pub fn write_parquet(path: &Path, candles: &[Candle]) -> Result<(), StoreError> {
    let batch = candles_to_record_batch(candles)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<Candle>, StoreError> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut candles = Vec::new();
    for batch in reader {
        candles.extend(record_batch_to_candles(&batch?)?);
    }

    Ok(candles)
}
