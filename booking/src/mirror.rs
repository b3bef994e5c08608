//! Best-effort per-tutor booking mirror.
//!
//! The mirror exists for read locality only. Reads always go to the primary
//! collection, so a failed mirror write is logged and counted, never raised.

use crate::documents::{encode_booking, mirror_key};
use crate::metrics;
use crate::types::BookingRecord;
use tutorlink_core::document_store::{DocumentStore, Write, WriteBatch};

/// Copy `booking` into its tutor's mirror collection.
///
/// Returns whether the copy landed.
pub async fn write_mirror(store: &dyn DocumentStore, booking: &BookingRecord) -> bool {
    let batch = WriteBatch::new().write(Write::Set {
        key: mirror_key(&booking.tutor_id, &booking.booking_id),
        data: encode_booking(booking),
    });

    match store.commit(batch).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                booking_id = %booking.booking_id,
                tutor_id = %booking.tutor_id,
                %error,
                "Mirror write failed; primary record is authoritative"
            );
            metrics::record_mirror_failure();
            false
        },
    }
}
