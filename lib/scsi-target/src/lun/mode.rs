// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mode pages, and the MODE SELECT / MODE SENSE logic over them.

use byteorder::{BigEndian, ByteOrder};

use crate::sense::SenseData;

pub const PAGE_CACHING: u8 = 0x08;
pub const PAGE_CONTROL: u8 = 0x0a;
pub const PAGE_ALL: u8 = 0x3f;

/// Page control field of MODE SENSE
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageControl {
    Current,
    Changeable,
    Default,
    Saved,
}
impl PageControl {
    pub fn from_cdb(pc: u8) -> Self {
        match pc & 0x3 {
            0 => Self::Current,
            1 => Self::Changeable,
            2 => Self::Default,
            _ => Self::Saved,
        }
    }
}

struct PageTemplate {
    code: u8,
    default: &'static [u8],
    changeable: &'static [u8],
}

const CACHING_LEN: usize = 0x12 + 2;
const CONTROL_LEN: usize = 0x0a + 2;

/// Caching: WCE set by default, WCE and RCD changeable
static CACHING_DEFAULT: [u8; CACHING_LEN] = {
    let mut p = [0u8; CACHING_LEN];
    p[0] = PAGE_CACHING;
    p[1] = (CACHING_LEN - 2) as u8;
    p[2] = 0x04;
    p
};
static CACHING_CHANGEABLE: [u8; CACHING_LEN] = {
    let mut p = [0u8; CACHING_LEN];
    p[2] = 0x05;
    p
};

/// Control: unrestricted reordering, busy timeout unlimited; QERR, SWP and
/// TAS changeable
static CONTROL_DEFAULT: [u8; CONTROL_LEN] = {
    let mut p = [0u8; CONTROL_LEN];
    p[0] = PAGE_CONTROL;
    p[1] = (CONTROL_LEN - 2) as u8;
    p[3] = 0x10;
    p[8] = 0xff;
    p[9] = 0xff;
    p
};
static CONTROL_CHANGEABLE: [u8; CONTROL_LEN] = {
    let mut p = [0u8; CONTROL_LEN];
    p[3] = 0x06;
    p[4] = 0x08;
    p[5] = 0x40;
    p
};

static TEMPLATES: [PageTemplate; 2] = [
    PageTemplate {
        code: PAGE_CACHING,
        default: &CACHING_DEFAULT,
        changeable: &CACHING_CHANGEABLE,
    },
    PageTemplate {
        code: PAGE_CONTROL,
        default: &CONTROL_DEFAULT,
        changeable: &CONTROL_CHANGEABLE,
    },
];

/// Check the static page templates for internal consistency, panicking if
/// they are malformed.
pub(crate) fn validate_templates() {
    for t in TEMPLATES.iter() {
        let len = t.default.len();
        assert_eq!(t.default[0] & 0x3f, t.code, "page {:#x} code", t.code);
        assert_eq!(t.default[1] as usize, len - 2, "page {:#x} len", t.code);
        assert_eq!(t.changeable.len(), len, "page {:#x} mask len", t.code);
        assert_eq!(
            &t.changeable[..2],
            &[0, 0],
            "page {:#x} header must not be changeable",
            t.code
        );
    }
    for pair in TEMPLATES.windows(2) {
        assert!(pair[0].code < pair[1].code, "templates unsorted");
    }
}

/// Locate the first bit which differs between `cur` and `new` while not
/// being covered by the `changeable` mask.  Bytes are scanned in order, and
/// bits within the offending byte from most to least significant.
pub(crate) fn first_unchangeable_bit(
    cur: &[u8],
    new: &[u8],
    changeable: &[u8],
) -> Option<(usize, u8)> {
    // Page code and length are validated separately
    (2..cur.len()).find_map(|i| {
        let diff = (cur[i] ^ new[i]) & !changeable[i];
        (diff != 0).then(|| (i, 7 - diff.leading_zeros() as u8))
    })
}

#[derive(Clone)]
pub struct ModePage {
    pub code: u8,
    current: Vec<u8>,
    saved: Vec<u8>,
    template: &'static PageTemplate,
}
impl ModePage {
    pub fn current(&self) -> &[u8] {
        &self.current
    }
    fn render(&self, pc: PageControl) -> &[u8] {
        match pc {
            PageControl::Current => &self.current,
            PageControl::Changeable => self.template.changeable,
            PageControl::Default => self.template.default,
            PageControl::Saved => &self.saved,
        }
    }
}

#[derive(Clone)]
pub struct ModePages {
    pages: Vec<ModePage>,
}
impl ModePages {
    pub fn new() -> Self {
        let pages = TEMPLATES
            .iter()
            .map(|t| ModePage {
                code: t.code,
                current: t.default.to_vec(),
                saved: t.default.to_vec(),
                template: t,
            })
            .collect();
        Self { pages }
    }

    pub fn get(&self, code: u8) -> Option<&ModePage> {
        self.pages.iter().find(|p| p.code == code)
    }

    /// Report TASK ABORTED status to other initiators on abort
    pub fn tas(&self) -> bool {
        self.get(PAGE_CONTROL)
            .map(|p| p.current[5] & 0x40 != 0)
            .unwrap_or(false)
    }
    /// Write cache enabled
    pub fn wce(&self) -> bool {
        self.get(PAGE_CACHING)
            .map(|p| p.current[2] & 0x04 != 0)
            .unwrap_or(false)
    }

    /// Apply a MODE SELECT parameter list.
    ///
    /// All pages are validated before any are applied.  Returns whether the
    /// current values actually changed.
    pub fn select(
        &mut self,
        param: &[u8],
        ten_byte: bool,
    ) -> Result<bool, SenseData> {
        let (hdr_len, bdl, bdl_off) = if ten_byte {
            if param.len() < 8 {
                return Err(SenseData::invalid_field_in_cdb(7, None));
            }
            (8, BigEndian::read_u16(&param[6..8]) as usize, 6)
        } else {
            if param.len() < 4 {
                return Err(SenseData::invalid_field_in_cdb(4, None));
            }
            (4, param[3] as usize, 3)
        };
        let mut off = hdr_len + bdl;
        if off > param.len() {
            return Err(SenseData::invalid_field_in_param(bdl_off, None));
        }

        let mut staged = Vec::new();
        while off < param.len() {
            if param.len() - off < 2 {
                return Err(SenseData::invalid_field_in_param(off as u16, None));
            }
            let code = param[off] & 0x3f;
            let Some(idx) = self.pages.iter().position(|p| p.code == code)
            else {
                return Err(SenseData::invalid_field_in_param(
                    off as u16,
                    Some(5),
                ));
            };
            let page = &self.pages[idx];
            let plen = param[off + 1] as usize + 2;
            if plen != page.current.len() || off + plen > param.len() {
                return Err(SenseData::invalid_field_in_param(
                    (off + 1) as u16,
                    None,
                ));
            }
            let new = &param[off..off + plen];
            if let Some((byte, bit)) = first_unchangeable_bit(
                &page.current,
                new,
                page.template.changeable,
            ) {
                return Err(SenseData::invalid_field_in_param(
                    (off + byte) as u16,
                    Some(bit),
                ));
            }
            staged.push((idx, off));
            off += plen;
        }

        let mut changed = false;
        for (idx, off) in staged {
            let page = &mut self.pages[idx];
            let mask = page.template.changeable;
            for i in 2..page.current.len() {
                let val =
                    (page.current[i] & !mask[i]) | (param[off + i] & mask[i]);
                changed |= val != page.current[i];
                page.current[i] = val;
            }
        }
        Ok(changed)
    }

    /// Build MODE SENSE response data.
    pub fn sense(
        &self,
        page_code: u8,
        pc: PageControl,
        ten_byte: bool,
        write_protect: bool,
        alloc_len: usize,
    ) -> Result<Vec<u8>, SenseData> {
        let selected: Vec<&ModePage> = if page_code == PAGE_ALL {
            self.pages.iter().collect()
        } else {
            match self.get(page_code) {
                Some(p) => vec![p],
                None => {
                    return Err(SenseData::invalid_field_in_cdb(2, Some(5)))
                }
            }
        };

        let devspec = 0x10 | if write_protect { 0x80 } else { 0 };
        let hdr_len = if ten_byte { 8 } else { 4 };
        let mut buf = vec![0u8; hdr_len];
        for page in selected {
            buf.extend_from_slice(page.render(pc));
        }
        if ten_byte {
            let len = (buf.len() - 2) as u16;
            BigEndian::write_u16(&mut buf[0..2], len);
            buf[3] = devspec;
        } else {
            buf[0] = (buf.len() - 1).min(u8::MAX as usize) as u8;
            buf[2] = devspec;
        }
        buf.truncate(alloc_len);
        Ok(buf)
    }
}
impl Default for ModePages {
    fn default() -> Self {
        Self::new()
    }
}
