//! Result materialization.
//!
//! Copies result bytes out of the result segment into host-managed memory
//! as typed values, and unrolls array-shaped results into rows for
//! set-returning procedures.

use pgaccel_core::arena::Arena;
use pgaccel_core::types::{array::ArrayReader, varlena, HostType, Value};
use pgaccel_core::CoreError;

use crate::error::PlGpuError;
#[cfg(unix)]
use crate::shmem::ShmSegment;

/// Copy the child-written result out of the segment into `arena`.
#[cfg(unix)]
pub fn materialize_scalar(
    segment: &ShmSegment,
    ret_type: HostType,
    arena: &Arena,
) -> Result<Value, PlGpuError> {
    let mapping = segment.map_ro()?;
    materialize_bytes(mapping.as_slice(), ret_type, arena)
}

pub fn materialize_bytes(
    buffer: &[u8],
    ret_type: HostType,
    arena: &Arena,
) -> Result<Value, PlGpuError> {
    let typlen = ret_type.len();
    if ret_type.byval() {
        Value::from_datum_bytes(ret_type, buffer).map_err(PlGpuError::Core)
    } else if typlen > 0 {
        let typlen = typlen as usize;
        if buffer.len() < typlen {
            return Err(PlGpuError::Core(CoreError::Corrupt(format!(
                "result segment shorter than a {} value",
                ret_type.name()
            ))));
        }
        Ok(Value::Fixed(arena.store(&buffer[..typlen])))
    } else {
        let total = varlena::total_size(buffer).map_err(PlGpuError::Core)?;
        if buffer.len() < total {
            return Err(PlGpuError::Core(CoreError::Corrupt(
                "result segment shorter than its varlena header claims".into(),
            )));
        }
        Ok(Value::Varlena(arena.store(&buffer[..total])))
    }
}

/// One row of a set-returning result.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultRow {
    Scalar(Value),
    Record(Vec<Value>),
}

/// Unroll an array-shaped result into rows. A 1-D array yields scalar rows
/// of the declared element type; a 2-D array (`nattrs x nitems`, zero lower
/// bounds) yields record rows of `nattrs` columns.
pub fn materialize_set(value: &Value, declared: HostType) -> Result<Vec<ResultRow>, PlGpuError> {
    let Value::Varlena(carrier) = value else {
        return Err(PlGpuError::Core(CoreError::Corrupt(
            "set-returning procedure produced a non-array result".into(),
        )));
    };
    let reader = ArrayReader::parse(carrier).map_err(PlGpuError::Core)?;

    if reader.lbounds.iter().any(|&lb| lb != 0) {
        return Err(PlGpuError::Core(CoreError::Corrupt(
            "procedure logic made wrong data array".into(),
        )));
    }

    match reader.ndim {
        1 => {
            if reader.elem_type != declared {
                return Err(PlGpuError::Core(CoreError::Corrupt(format!(
                    "procedure returned wrong type: {}, not {}",
                    reader.elem_type.name(),
                    declared.name()
                ))));
            }
            let values = reader.values().map_err(PlGpuError::Core)?;
            Ok(values.into_iter().map(ResultRow::Scalar).collect())
        }
        2 => {
            let nattrs = reader.dims[0] as usize;
            if nattrs == 0 {
                return Err(PlGpuError::Core(CoreError::Corrupt(
                    "procedure logic made wrong data array".into(),
                )));
            }
            let values = reader.values().map_err(PlGpuError::Core)?;
            Ok(values
                .chunks(nattrs)
                .map(|row| ResultRow::Record(row.to_vec()))
                .collect())
        }
        _ => Err(PlGpuError::Core(CoreError::Corrupt(
            "procedure logic made wrong data array".into(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgaccel_core::types::array;
    use std::sync::Arc;

    #[test]
    fn scalar_byval_result() {
        let arena = Arena::new("results");
        let buffer = 123456789i64.to_le_bytes();
        let value = materialize_bytes(&buffer, HostType::Int8, &arena).expect("value");
        assert_eq!(value, Value::Int8(123456789));
    }

    #[test]
    fn scalar_varlena_result_lands_in_arena() {
        let arena = Arena::new("results");
        let mut buffer = varlena::make(b"payload");
        buffer.resize(8192, 0); // segment is block-sized
        let value = materialize_bytes(&buffer, HostType::Bytea, &arena).expect("value");
        match value {
            Value::Varlena(bytes) => {
                assert_eq!(varlena::payload(&bytes).expect("payload"), b"payload")
            }
            other => panic!("unexpected value {other:?}"),
        }
        assert!(arena.allocated() > 0);
    }

    #[test]
    fn one_dimensional_array_yields_scalar_rows() {
        let values = vec![Value::Int4(1), Value::Null, Value::Int4(3)];
        let carrier = array::build(HostType::Int4, &[3], &values).expect("array");
        let result = Value::Varlena(Arc::from(carrier.as_slice()));
        let rows = materialize_set(&result, HostType::Int4).expect("rows");
        assert_eq!(
            rows,
            vec![
                ResultRow::Scalar(Value::Int4(1)),
                ResultRow::Scalar(Value::Null),
                ResultRow::Scalar(Value::Int4(3)),
            ]
        );
    }

    #[test]
    fn one_dimensional_array_checks_element_type() {
        let carrier =
            array::build(HostType::Int8, &[1], &[Value::Int8(5)]).expect("array");
        let result = Value::Varlena(Arc::from(carrier.as_slice()));
        assert!(materialize_set(&result, HostType::Int4).is_err());
    }

    #[test]
    fn two_dimensional_array_yields_records() {
        let values: Vec<Value> = (0..6).map(|v| Value::Float8(v as f64)).collect();
        let carrier = array::build(HostType::Float8, &[2, 3], &values).expect("array");
        let result = Value::Varlena(Arc::from(carrier.as_slice()));
        let rows = materialize_set(&result, HostType::Float8).expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            ResultRow::Record(vec![Value::Float8(0.0), Value::Float8(1.0)])
        );
    }
}
