use std::ops::AddAssign;

/// The UDP header that every datagram carries on top of its payload, counted in telemetry
pub const UDP_HEADER_LEN: usize = 8;

/// Byte counts for bandwidth accounting. This is purely observational.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Telemetry {
    pub upload_byte_count: u64,
    pub download_byte_count: u64,
}

impl Telemetry {
    pub fn uploaded(num_bytes: u64) -> Telemetry {
        Telemetry {
            upload_byte_count: num_bytes,
            download_byte_count: 0,
        }
    }

    pub fn downloaded(num_bytes: u64) -> Telemetry {
        Telemetry {
            upload_byte_count: 0,
            download_byte_count: num_bytes,
        }
    }
}

impl AddAssign for Telemetry {
    fn add_assign(&mut self, rhs: Telemetry) {
        self.upload_byte_count += rhs.upload_byte_count;
        self.download_byte_count += rhs.download_byte_count;
    }
}
