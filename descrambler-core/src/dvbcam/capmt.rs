//! EN 50221 CA_PMT objects built from a PMT section.

use crate::Error;

const PMT_TABLE_ID: u8 = 0x02;
const CA_DESCRIPTOR_TAG: u8 = 0x09;
/// program_number .. program_info_length, counted from the end of the
/// section header.
const PMT_FIXED_LEN: usize = 9;
const CRC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListManagement {
    More = 0,
    First = 1,
    Last = 2,
    /// The only programme on the module.
    Only = 3,
    /// One more programme next to those already selected.
    Add = 4,
    Update = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaPmtCommand {
    OkDescrambling = 1,
    OkMmi = 2,
    Query = 3,
    NotSelected = 4,
}

fn len12(data: &[u8]) -> usize {
    usize::from(data[0] & 0x0f) << 8 | usize::from(data[1])
}

fn put_len12(dst: &mut [u8], len: usize) {
    dst[0] = 0xf0 | ((len >> 8) & 0x0f) as u8;
    dst[1] = len as u8;
}

/// Copies the CA descriptors of an allowed CA system from one descriptor
/// loop, preceded by `cmd` when there is at least one.
fn copy_ca_descriptors(mut loop_data: &[u8], caids: &[u16], cmd: CaPmtCommand, out: &mut Vec<u8>) -> crate::Result<()> {
    let mut first = true;
    while loop_data.len() > 1 {
        let tag = loop_data[0];
        let len = usize::from(loop_data[1]);
        let Some(descriptor) = loop_data.get(..2 + len) else {
            return Err(Error::invalid_input("truncated PMT descriptor"));
        };
        if tag == CA_DESCRIPTOR_TAG && len >= 4 {
            let caid = u16::from_be_bytes([descriptor[2], descriptor[3]]);
            if caids.contains(&caid) {
                if first {
                    out.push(cmd as u8);
                    first = false;
                }
                out.extend_from_slice(descriptor);
            }
        }
        loop_data = &loop_data[2 + len..];
    }
    if !loop_data.is_empty() {
        return Err(Error::invalid_input("trailing byte in PMT descriptor loop"));
    }
    Ok(())
}

/// Builds the CA_PMT for a complete PMT section, keeping only CA
/// descriptors of `caids`.
pub fn build(pmt: &[u8], list: ListManagement, cmd: CaPmtCommand, caids: &[u16]) -> crate::Result<Vec<u8>> {
    if pmt.len() < 3 || pmt[0] != PMT_TABLE_ID {
        return Err(Error::invalid_input("not a PMT section"));
    }
    let section_len = len12(&pmt[1..]);
    let body = pmt
        .get(3..3 + section_len)
        .and_then(|s| s.get(..s.len().checked_sub(CRC_LEN)?))
        .filter(|body| body.len() >= PMT_FIXED_LEN)
        .ok_or_else(|| Error::invalid_input("truncated PMT section"))?;

    let mut out = Vec::with_capacity(body.len() * 2);
    out.push(list as u8);
    out.extend_from_slice(&body[..2]);
    // version and current_next_indicator
    out.push(body[2]);
    out.extend_from_slice(&[0xf0, 0x00]);

    let info_len = len12(&body[7..]);
    let program_info = body
        .get(PMT_FIXED_LEN..PMT_FIXED_LEN + info_len)
        .ok_or_else(|| Error::invalid_input("program info exceeds PMT section"))?;
    copy_ca_descriptors(program_info, caids, cmd, &mut out)?;
    let written = out.len() - 6;
    put_len12(&mut out[4..6], written);

    let mut streams = &body[PMT_FIXED_LEN + info_len..];
    while !streams.is_empty() {
        if streams.len() < 5 {
            return Err(Error::invalid_input("truncated elementary stream entry"));
        }
        let es_len = len12(&streams[3..]);
        let es_info = streams
            .get(5..5 + es_len)
            .ok_or_else(|| Error::invalid_input("elementary stream info exceeds PMT section"))?;
        let start = out.len();
        // stream type and PID
        out.extend_from_slice(&streams[..3]);
        out.extend_from_slice(&[0xf0, 0x00]);
        copy_ca_descriptors(es_info, caids, cmd, &mut out)?;
        let written = out.len() - start - 5;
        put_len12(&mut out[start + 3..start + 5], written);
        streams = &streams[5 + es_len..];
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ts::section_crc;

    fn ca(caid: u16, pid: u16) -> Vec<u8> {
        let [c0, c1] = caid.to_be_bytes();
        vec![0x09, 4, c0, c1, 0xe0 | (pid >> 8) as u8, pid as u8]
    }

    /// PMT of programme 0x1234 with Conax and Viaccess on programme level,
    /// a clear video stream and an audio stream carrying its own Conax ECM.
    pub(crate) fn pmt_section() -> Vec<u8> {
        let mut info = ca(0x0b00, 0x100);
        info.extend(ca(0x0500, 0x101));
        let audio_info = ca(0x0b00, 0x102);

        let mut body = vec![0x12, 0x34, 0xc3, 0x00, 0x00, 0xe1, 0xff];
        body.extend_from_slice(&[0xf0, info.len() as u8]);
        body.extend(info);
        body.extend_from_slice(&[0x02, 0xe2, 0x00, 0xf0, 0x00]);
        body.extend_from_slice(&[0x04, 0xe2, 0x01, 0xf0, audio_info.len() as u8]);
        body.extend(audio_info);

        let section_len = body.len() + CRC_LEN;
        let mut section = vec![PMT_TABLE_ID, 0xb0 | (section_len >> 8) as u8, section_len as u8];
        section.extend(body);
        let crc = section_crc(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    #[test]
    fn test_build_keeps_allowed_ca_descriptors() {
        let capmt = build(&pmt_section(), ListManagement::Only, CaPmtCommand::OkDescrambling, &[0x0b00]).unwrap();
        let mut expected = vec![3, 0x12, 0x34, 0xc3, 0xf0, 7, 1];
        expected.extend(ca(0x0b00, 0x100));
        expected.extend_from_slice(&[0x02, 0xe2, 0x00, 0xf0, 0x00]);
        expected.extend_from_slice(&[0x04, 0xe2, 0x01, 0xf0, 7, 1]);
        expected.extend(ca(0x0b00, 0x102));
        assert_eq!(capmt, expected);
    }

    #[test]
    fn test_build_without_matching_caid() {
        let capmt = build(&pmt_section(), ListManagement::Update, CaPmtCommand::NotSelected, &[0x1800]).unwrap();
        assert_eq!(
            capmt,
            vec![5, 0x12, 0x34, 0xc3, 0xf0, 0, 0x02, 0xe2, 0x00, 0xf0, 0x00, 0x04, 0xe2, 0x01, 0xf0, 0x00]
        );
    }

    #[test]
    fn test_build_rejects_malformed_sections() {
        let mut pmt = pmt_section();
        assert!(build(&pmt[..10], ListManagement::Only, CaPmtCommand::OkDescrambling, &[]).is_err());
        pmt[0] = 0x03;
        assert!(build(&pmt, ListManagement::Only, CaPmtCommand::OkDescrambling, &[]).is_err());

        // program_info_length running past the section
        let mut pmt = pmt_section();
        pmt[11] = 0xff;
        assert!(build(&pmt, ListManagement::Only, CaPmtCommand::OkDescrambling, &[]).is_err());
    }
}
