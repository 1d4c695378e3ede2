#![no_main]

use libfuzzer_sys::fuzz_target;

use xatm_core::Xid;

fuzz_target!(|data: &[u8]| {
    if let Ok(xid) = Xid::from_bytes(data) {
        assert_eq!(xid.to_bytes(), data);
        let _ = xid.kind();
    }
});
