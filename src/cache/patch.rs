//! In-place replacement of a single record inside a cached payload.

use serde_json::Value;

use super::traits::PayloadShape;

/// Replace the record whose `id_field` equals `item_id` with `updater(record)`.
///
/// Only the first matching record is touched; everything else in the payload
/// stays as it was. Returns `true` if a record was replaced.
pub fn patch_item<F>(
  payload: &mut Value,
  shape: PayloadShape,
  id_field: &str,
  item_id: &Value,
  updater: &mut F,
) -> bool
where
  F: FnMut(&Value) -> Value,
{
  let Some(records) = shape.records_mut(payload) else {
    return false;
  };

  match records
    .iter_mut()
    .find(|record| record.get(id_field) == Some(item_id))
  {
    Some(record) => {
      *record = updater(record);
      true
    }
    None => false,
  }
}
