#![no_main]

use libfuzzer_sys::fuzz_target;

use xatm_core::Xid;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(xid) = Xid::parse(text) {
            let reparsed = Xid::parse(&xid.to_string()).expect("canonical form must parse");
            assert_eq!(reparsed, xid);
        }
    }
});
