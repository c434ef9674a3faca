#![no_main]

use libfuzzer_sys::fuzz_target;

use usbredir::{Cap, CapSet, PacketHandler, Parser, ParserFlags, Transport};

struct Bytes<'a>(&'a [u8]);

impl Transport for Bytes<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.0.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "dry"));
        }
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0 = &self.0[n..];
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }
}

struct Ignore;
impl PacketHandler for Ignore {}

fuzz_target!(|data: &[u8]| {
    let parser = Parser::new(
        "fuzz",
        CapSet::from_caps(&[
            Cap::ConnectDeviceVersion,
            Cap::Filter,
            Cap::EpInfoMaxPacketSize,
            Cap::Ids64Bits,
            Cap::BulkLength32Bits,
            Cap::BulkReceiving,
        ]),
        ParserFlags {
            usb_host: true,
            no_hello: true,
            ..Default::default()
        },
    );
    let mut transport = Bytes(data);
    let mut handler = Ignore;
    while parser.do_read(&mut transport, &mut handler).is_err() {
        if transport.0.is_empty() {
            break;
        }
    }
});
