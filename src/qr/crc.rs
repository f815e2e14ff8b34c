//! CRC16-CCITT (poly 0x1021, init 0xFFFF, no reflection, no final XOR).

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Four uppercase hex digits, as carried in tag 63.
pub fn crc16_hex(data: &[u8]) -> String {
    format!("{:04X}", crc16_ccitt(data))
}
