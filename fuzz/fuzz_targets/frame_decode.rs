#![no_main]

use libfuzzer_sys::fuzz_target;

use crucible_types::frame;
use crucible_types::{TaskDownload, TaskRecord};

fuzz_target!(|data: &[u8]| {
    // The decoder must never panic on arbitrary bytes, prefixed or bare.
    let _ = frame::peek_tag(data);
    let _ = frame::decode_any(data);
    let _ = frame::decode_value_any(data);
    let _ = frame::decode::<TaskDownload>(data);
    let _ = frame::decode_value::<TaskRecord>(data);

    // Anything that decodes must re-encode and decode to the same value.
    if let Ok(record) = frame::decode_value::<TaskDownload>(data) {
        let bytes = frame::encode_value(&record).expect("re-encode");
        let again: TaskDownload = frame::decode_value(&bytes).expect("re-decode");
        assert_eq!(record.task.task_id, again.task.task_id);
        assert_eq!(record.task.deadline, again.task.deadline);
    }
});
