//! Fuzz target for the NRTM3 request parser.
//!
//! Request lines come straight off the socket, so parsing must never panic
//! and every rejection must map to a legacy code.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nrtm_engine::nrtm3::{Query, QueryMode, SerialEnd};
use nrtm_engine::SourceContext;

fuzz_target!(|line: &str| {
    let context = SourceContext::new("RIPE").with_non_authoritative("RIPE-NONAUTH");

    match Query::parse(&context, line) {
        Ok(query) => {
            // Accepted mirror ranges are well-formed
            if query.mode == QueryMode::Mirror {
                assert!(query.serial_begin >= 0);
                if let SerialEnd::At(end) = query.serial_end {
                    assert!(end >= query.serial_begin);
                }
                assert!(context.resolve(query.source.as_str()).is_some());
            } else {
                assert!(query.info_option.is_some());
                assert!(!query.keepalive);
            }
        }
        Err(err) => {
            let code = err.code().as_u16();
            assert!(matches!(code, 400 | 401 | 403 | 405 | 406));
            assert!(err.wire_response().starts_with(&format!("ERROR:{}", code)));
        }
    }
});
