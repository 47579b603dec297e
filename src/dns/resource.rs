use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::{
    ParseError,
    common::PacketComponent,
    enums::{DNSResourceClass, DNSResourceType},
};

/// A resource record with its RDATA kept as raw wire bytes. The cache serves
/// the original upstream wire, so RDATA is never re-interpreted except for
/// the SOA MINIMUM field used by negative caching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DNSResource {
    pub labels: Vec<String>,
    pub rtype: DNSResourceType,
    pub rclass: DNSResourceClass,
    pub ttl: u32,
    pub rdlength: u16,
    pub rdata: Vec<u8>,
}

impl DNSResource {
    /// SOA RDATA ends with the 32-bit MINIMUM field regardless of how the
    /// MNAME/RNAME names are encoded.
    pub fn soa_minimum(&self) -> Option<u32> {
        if self.rtype != DNSResourceType::SOA || self.rdata.len() < 4 {
            return None;
        }
        let tail = &self.rdata[self.rdata.len() - 4..];
        Some(u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]))
    }
}

impl PacketComponent for DNSResource {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        self.write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.rtype.into())?;
        writer.write_var::<u16>(16, self.rclass.into())?;
        writer.write_var::<u32>(32, self.ttl)?;
        writer.write_var::<u16>(16, self.rdata.len() as u16)?;
        writer.write_bytes(&self.rdata)?;
        Ok(())
    }

    fn read_with_buffer<E: Endianness>(
        &mut self,
        reader: &mut BitReader<&[u8], E>,
        packet_buf: &[u8],
    ) -> Result<(), ParseError> {
        let labels = self.read_labels_with_buffer(reader, packet_buf)?;
        let rtype = reader.read_var::<u16>(16)?.into();
        let rclass = reader.read_var::<u16>(16)?.into();
        let ttl = reader.read_var::<u32>(32)?;
        let rdlength = reader.read_var::<u16>(16)?;
        let mut rdata = vec![0; rdlength as usize];
        reader.read_bytes(&mut rdata)?;
        *self = DNSResource {
            labels,
            rtype,
            rclass,
            ttl,
            rdlength,
            rdata,
        };
        Ok(())
    }
}
