use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::{
    ParseError,
    common::PacketComponent,
    enums::{DNSResourceClass, DNSResourceType},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DNSQuestion {
    pub labels: Vec<String>,
    pub qtype: DNSResourceType,
    pub qclass: DNSResourceClass,
}

impl DNSQuestion {
    /// Question name as a dotted string, no trailing dot.
    pub fn domain(&self) -> String {
        let mut domain = String::with_capacity(64);
        let mut first = true;
        for label in self.labels.iter() {
            if !label.is_empty() {
                if !first {
                    domain.push('.');
                }
                domain.push_str(label);
                first = false;
            }
        }
        domain
    }
}

impl PacketComponent for DNSQuestion {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        self.write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.qtype.into())?;
        writer.write_var::<u16>(16, self.qclass.into())?;
        Ok(())
    }

    fn read_with_buffer<E: Endianness>(
        &mut self,
        reader: &mut BitReader<&[u8], E>,
        packet_buf: &[u8],
    ) -> Result<(), ParseError> {
        let labels = self.read_labels_with_buffer(reader, packet_buf)?;
        let qtype = reader.read_var::<u16>(16)?.into();
        let qclass = reader.read_var::<u16>(16)?.into();
        *self = DNSQuestion {
            labels,
            qtype,
            qclass,
        };
        Ok(())
    }
}
