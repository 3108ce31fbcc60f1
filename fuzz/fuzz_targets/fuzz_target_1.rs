#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_engine::PacketReader;

fuzz_target!(|data: &[u8]| {
    // Field readers over hostile input: no panics, no reads past the end
    let mut reader = PacketReader::new(data);
    // backward seeks revisit bytes, so bound the walk
    for _ in 0..data.len() {
        let Ok(kind) = reader.read_u8() else { break };
        let _ = match kind % 6 {
            0 => reader.read_ascii((kind / 6) as usize).map(drop),
            1 => reader.read_utf16be((kind / 6) as usize).map(drop),
            2 => reader.read_terminated_ascii().map(drop),
            3 => reader.read_prefixed_utf8().map(drop),
            4 => reader.read_u32().map(drop),
            _ => reader.seek_from_current(-(kind as isize % 4)),
        };
    }
    assert!(reader.consumed() <= data.len());
});
