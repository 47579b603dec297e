use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::ParseError;

const MAX_POINTER_JUMPS: usize = 100;

/// Parse a domain name starting at `offset` in the full packet buffer,
/// following compression pointers. Returns the labels.
pub fn parse_name_at(buf: &[u8], offset: usize) -> Result<Vec<String>, ParseError> {
    let mut labels = Vec::new();
    let mut pos = offset;
    let mut jumps = 0;

    loop {
        let first_byte = *buf.get(pos).ok_or(ParseError::BufferTooSmall)?;

        if first_byte == 0 {
            break;
        }

        if (first_byte & 0xC0) == 0xC0 {
            let second_byte = *buf.get(pos + 1).ok_or(ParseError::BufferTooSmall)?;
            pos = (((first_byte as u16 & 0x3F) << 8) | second_byte as u16) as usize;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(ParseError::PointerLoop);
            }
            continue;
        }

        if first_byte > 63 {
            return Err(ParseError::InvalidLabel);
        }

        let start = pos + 1;
        let end = start + first_byte as usize;
        let label_bytes = buf.get(start..end).ok_or(ParseError::BufferTooSmall)?;
        let label =
            String::from_utf8(label_bytes.to_vec()).map_err(|_| ParseError::InvalidLabel)?;
        labels.push(label);
        pos = end;
    }

    Ok(labels)
}

pub trait PacketComponent {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError>;

    fn read_with_buffer<E: Endianness>(
        &mut self,
        reader: &mut BitReader<&[u8], E>,
        packet_buf: &[u8],
    ) -> Result<(), ParseError>;

    fn read_labels_with_buffer<E: Endianness>(
        &mut self,
        reader: &mut BitReader<&[u8], E>,
        packet_buf: &[u8],
    ) -> Result<Vec<String>, ParseError> {
        let mut labels = Vec::new();
        let mut read_count = 0;

        loop {
            let first_byte = reader.read_var::<u8>(8)?;

            if first_byte == 0 {
                break;
            }

            if (first_byte & 0xC0) == 0xC0 {
                // Compression pointer; the rest of the name lives elsewhere
                // in the packet.
                let second_byte = reader.read_var::<u8>(8)?;
                let pointer = ((first_byte as u16 & 0x3F) << 8) | second_byte as u16;
                let pointer_labels = parse_name_at(packet_buf, pointer as usize)?;
                labels.extend(pointer_labels);
                break;
            }

            if first_byte > 63 {
                return Err(ParseError::InvalidLabel);
            }

            let mut label_buf = vec![0; first_byte as usize];
            reader.read_bytes(&mut label_buf)?;
            let label = String::from_utf8(label_buf).map_err(|_| ParseError::InvalidLabel)?;
            labels.push(label);

            read_count += 1;
            if read_count > MAX_POINTER_JUMPS {
                return Err(ParseError::InvalidLabel);
            }
        }

        Ok(labels)
    }

    fn write_labels<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
        labels: &[String],
    ) -> Result<(), ParseError> {
        for label in labels {
            if label.is_empty() {
                continue;
            }
            writer.write_var::<u8>(8, label.len() as u8)?;
            writer.write_bytes(label.as_bytes())?;
        }
        writer.write_var::<u8>(8, 0)?;
        Ok(())
    }
}
