//! Columnar Schema Helpers
//!
//! Shared Arrow construction and decoding for the decimal128(38,18)
//! price/quantity columns and the `list<struct{price, qty}>` level lists
//! used by the input store, the sink, and the checkpoint files.

use crate::recon::error::ReconError;
use crate::recon::events::PriceLevel;
use crate::recon::fixed::FixedPoint;
use arrow::array::{
    Array, ArrayRef, Decimal128Array, Decimal128Builder, ListArray, ListBuilder, StructArray,
    StructBuilder, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Fields};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Precision/scale of every price and quantity column on disk.
pub const DECIMAL_PRECISION: u8 = 38;
pub const DECIMAL_SCALE: i8 = 18;

/// The on-disk decimal type.
pub fn decimal_type() -> DataType {
    DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE)
}

/// Fields of one price level struct.
pub fn level_fields() -> Fields {
    Fields::from(vec![
        Field::new("price", decimal_type(), false),
        Field::new("qty", decimal_type(), false),
    ])
}

/// Item field of a level list.
pub fn level_item_field() -> Arc<Field> {
    Arc::new(Field::new(
        "item",
        DataType::Struct(level_fields()),
        false,
    ))
}

/// The `list<struct{price, qty}>` column type.
pub fn level_list_type() -> DataType {
    DataType::List(level_item_field())
}

/// Build a decimal128(38,18) column from raw i128 values.
pub fn decimal_array<I>(values: I) -> Result<Decimal128Array, ReconError>
where
    I: IntoIterator<Item = Option<i128>>,
{
    let array: Decimal128Array = values.into_iter().collect();
    Ok(array.with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)?)
}

/// Build a level-list column. `None` rows become null lists.
pub fn level_list_array(rows: &[Option<&[PriceLevel]>]) -> ListArray {
    let struct_builder = StructBuilder::new(
        level_fields(),
        vec![
            Box::new(Decimal128Builder::new().with_data_type(decimal_type())),
            Box::new(Decimal128Builder::new().with_data_type(decimal_type())),
        ],
    );
    let mut builder = ListBuilder::new(struct_builder).with_field(level_item_field());

    for row in rows {
        match row {
            Some(levels) => {
                for (price, qty) in levels.iter() {
                    let values = builder.values();
                    values
                        .field_builder::<Decimal128Builder>(0)
                        .expect("price builder")
                        .append_value(price.to_decimal128_18());
                    values
                        .field_builder::<Decimal128Builder>(1)
                        .expect("qty builder")
                        .append_value(qty.to_decimal128_18());
                    values.append(true);
                }
                builder.append(true);
            }
            None => builder.append(false),
        }
    }

    builder.finish()
}

/// Fetch a named column, with a schema-mismatch error naming the file.
pub fn column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    file: &str,
) -> Result<&'a ArrayRef, ReconError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("missing column {:?}", name),
        })
}

/// Downcast a column to `UInt64Array`.
pub fn u64_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    file: &str,
) -> Result<&'a UInt64Array, ReconError> {
    column(batch, name, file)?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} is not u64", name),
        })
}

/// Downcast a column to `Decimal128Array`.
pub fn decimal_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    file: &str,
) -> Result<&'a Decimal128Array, ReconError> {
    column(batch, name, file)?
        .as_any()
        .downcast_ref::<Decimal128Array>()
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} is not decimal128", name),
        })
}

/// Downcast a column to `ListArray`.
pub fn list_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    file: &str,
) -> Result<&'a ListArray, ReconError> {
    column(batch, name, file)?
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} is not a list", name),
        })
}

/// Read a required u64 cell.
pub fn u64_value(array: &UInt64Array, row: usize, name: &str, file: &str) -> Result<u64, ReconError> {
    if array.is_null(row) {
        return Err(ReconError::DecodeError {
            file: file.to_string(),
            row: row as u64,
            detail: format!("null {}", name),
        });
    }
    Ok(array.value(row))
}

/// Read a required decimal cell as fixed-point.
pub fn fp_value(
    array: &Decimal128Array,
    row: usize,
    name: &str,
    file: &str,
) -> Result<FixedPoint, ReconError> {
    if array.is_null(row) {
        return Err(ReconError::DecodeError {
            file: file.to_string(),
            row: row as u64,
            detail: format!("null {}", name),
        });
    }
    FixedPoint::from_decimal128_18(array.value(row))
}

/// Decode one row of a level-list column into fixed-point levels.
pub fn read_levels(
    list: &ListArray,
    row: usize,
    name: &str,
    file: &str,
) -> Result<Vec<PriceLevel>, ReconError> {
    if list.is_null(row) {
        return Err(ReconError::DecodeError {
            file: file.to_string(),
            row: row as u64,
            detail: format!("null {}", name),
        });
    }
    let entry = list.value(row);
    let levels = entry
        .as_any()
        .downcast_ref::<StructArray>()
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} items are not structs", name),
        })?;
    let prices = levels
        .column_by_name("price")
        .and_then(|c| c.as_any().downcast_ref::<Decimal128Array>().cloned())
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} items lack a decimal price", name),
        })?;
    let qtys = levels
        .column_by_name("qty")
        .and_then(|c| c.as_any().downcast_ref::<Decimal128Array>().cloned())
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: format!("column {:?} items lack a decimal qty", name),
        })?;

    let mut out = Vec::with_capacity(levels.len());
    for i in 0..levels.len() {
        let price = FixedPoint::from_decimal128_18(prices.value(i))?;
        let qty = FixedPoint::from_decimal128_18(qtys.value(i))?;
        out.push((price, qty));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(raw: i64) -> FixedPoint {
        FixedPoint::from_raw(raw)
    }

    #[test]
    fn test_level_list_round_trip() {
        let levels_a = vec![(fp(10_000_000_000), fp(100_000_000))];
        let levels_b: Vec<PriceLevel> = vec![];
        let rows: Vec<Option<&[PriceLevel]>> =
            vec![Some(&levels_a), None, Some(&levels_b)];
        let list = level_list_array(&rows);

        assert_eq!(list.len(), 3);
        assert!(!list.is_null(0));
        assert!(list.is_null(1));

        let decoded = read_levels(&list, 0, "bids", "f").unwrap();
        assert_eq!(decoded, levels_a);
        let empty = read_levels(&list, 2, "bids", "f").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_decimal_array_scale() {
        let array = decimal_array(vec![Some(fp(150_000_000).to_decimal128_18()), None]).unwrap();
        assert_eq!(array.precision(), DECIMAL_PRECISION);
        assert_eq!(array.scale(), DECIMAL_SCALE);
        assert_eq!(
            FixedPoint::from_decimal128_18(array.value(0)).unwrap(),
            fp(150_000_000)
        );
        assert!(array.is_null(1));
    }
}
