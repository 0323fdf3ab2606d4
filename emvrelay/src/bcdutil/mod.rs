//cn = 12 34 56 78 90 12 3F FF
pub fn bcd_to_ascii(bcd_data: &[u8]) -> Result<Vec<u8>, ()> {
    let mut ascii_output: Vec<u8> = Vec::with_capacity(bcd_data.len() * 2);

    const ASCII_CHARACTER_0: u8 = 0x30;

    for i in 0..bcd_data.len() {
        let byte = bcd_data[i];
        let n2 = byte >> 4;
        let n1 = byte & 0xF;

        if byte == 0xFF {
            break;
        }
        if n2 > 0x9 {
            return Err(());
        }
        ascii_output.push(ASCII_CHARACTER_0 + n2);

        if n1 != 0xF {
            if n1 > 0x9 {
                return Err(());
            }
            ascii_output.push(ASCII_CHARACTER_0 + n1);
        } else if i != bcd_data.len() - 1 && bcd_data[i + 1] != 0xFF {
            return Err(());
        }
    }

    Ok(ascii_output)
}

/// Application PAN (tag 5A) as a digit string.
pub fn pan_from_bcd(bcd_data: &[u8]) -> Option<String> {
    let ascii = bcd_to_ascii(bcd_data).ok()?;
    if ascii.is_empty() {
        return None;
    }

    String::from_utf8(ascii).ok()
}

//cn = 12 34 56 78 90 12 3F FF
pub fn ascii_to_bcd_cn(ascii_data: &[u8], size: usize) -> Result<Vec<u8>, ()> {
    if ascii_data.len() > size * 2 {
        return Err(());
    }

    let mut bcd_output: Vec<u8> = Vec::with_capacity(size);

    const ASCII_CHARACTER_0: u8 = 0x30;

    for i in (0..ascii_data.len()).step_by(2) {
        let b1 = ascii_data[i].wrapping_sub(ASCII_CHARACTER_0);
        if b1 > 0x9 {
            return Err(());
        }

        let mut b2 = 0xF;
        if i + 1 < ascii_data.len() {
            b2 = ascii_data[i + 1].wrapping_sub(ASCII_CHARACTER_0);
            if b2 > 0x9 {
                return Err(());
            }
        }

        bcd_output.push(b2 + (b1 << 4));
    }

    for _ in bcd_output.len()..size {
        bcd_output.push(0xFF);
    }

    Ok(bcd_output)
}
