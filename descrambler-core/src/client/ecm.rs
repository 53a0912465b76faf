//! Per-service ECM bookkeeping of a network client: which ECM PIDs and
//! sections were requested, what the server answered and when to give up.

use std::time::Duration;

use tokio::time::Instant;

/// Consecutive negative answers after which a section is given up.
pub const MAX_NOKS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Unknown,
    Resolved,
    Forbidden,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcmState {
    /// Choosing ECM PIDs.
    Init,
    /// A PID has answered with keys.
    Valid,
    /// Start over with the next ECM.
    Reset,
}

#[derive(Debug)]
pub struct EcmSection {
    pub number: u8,
    data: Vec<u8>,
    pub state: SectionState,
    pub pending: bool,
    /// Answered since it was last sent.
    pub resolved: bool,
    pub seq: u32,
    pub sent: Option<Instant>,
    pub pid: u16,
    pub caid: u16,
    pub provider: u32,
    pub card_id: u32,
    pub noks: u8,
}

impl EcmSection {
    fn new(number: u8) -> Self {
        Self {
            number,
            data: Vec::new(),
            state: SectionState::Unknown,
            pending: false,
            resolved: false,
            seq: 0,
            sent: None,
            pid: 0,
            caid: 0,
            provider: 0,
            card_id: 0,
            noks: 0,
        }
    }

    /// Stores `data`; returns `false` when it equals what was stored.
    pub fn store(&mut self, data: &[u8]) -> bool {
        if self.data == data {
            return false;
        }
        self.data.clear();
        self.data.extend_from_slice(data);
        true
    }

    fn forget(&mut self) {
        self.data.clear();
    }
}

#[derive(Debug)]
struct EcmPid {
    pid: u16,
    last_section: u8,
    sections: Vec<EcmSection>,
}

/// Where a sequence number was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqLookup {
    Pending(SectionRef),
    /// Already answered; a duplicate or late reply.
    Answered,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pid: usize,
    section: usize,
}

/// What the owner of the book must do after an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    /// Install the keys.
    Keys,
    /// Negative answer. With `go_idle` a sibling already supplies keys and
    /// this handle should step back.
    Nok { go_idle: bool },
    /// No section can be resolved any more; the handle is forbidden.
    Forbidden,
}

#[derive(Debug)]
pub struct EcmBook {
    state: EcmState,
    /// ECM PID that produced the last keys.
    capid: Option<u16>,
    pids: Vec<EcmPid>,
}

impl Default for EcmBook {
    fn default() -> Self {
        Self {
            state: EcmState::Init,
            capid: None,
            pids: Vec::new(),
        }
    }
}

impl EcmBook {
    pub fn state(&self) -> EcmState {
        self.state
    }

    pub fn capid(&self) -> Option<u16> {
        self.capid
    }

    /// Back to PID selection, e.g. after the ECM PIDs of the service changed.
    pub fn restart(&mut self) {
        self.capid = None;
        self.state = EcmState::Init;
    }

    /// Forget every answer so the next ECM is requested again.
    pub fn reset(&mut self) {
        self.set_all(SectionState::Unknown);
    }

    /// Stop requesting; another handle supplies the keys.
    pub fn idle(&mut self) {
        self.set_all(SectionState::Idle);
    }

    fn set_all(&mut self, state: SectionState) {
        for section in self.sections_mut() {
            section.state = state;
            section.forget();
        }
        self.state = EcmState::Reset;
    }

    /// Drops stored ECM contents and pending flags so that every section is
    /// sent again on a new connection.
    pub fn flush(&mut self) {
        for section in self.sections_mut() {
            section.forget();
            section.pending = false;
        }
    }

    /// Applies a pending reset before new input. Returns `true` when the book
    /// was cleared.
    pub fn begin_input(&mut self) -> bool {
        if self.state != EcmState::Reset {
            return false;
        }
        self.pids.clear();
        self.restart();
        true
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        self.pids.iter().any(|p| p.pid == pid)
    }

    pub fn insert_pid(&mut self, pid: u16) {
        if !self.has_pid(pid) {
            self.pids.push(EcmPid {
                pid,
                last_section: 0,
                sections: Vec::new(),
            });
        }
    }

    pub fn last_section(&self, pid: u16) -> u8 {
        self.pids
            .iter()
            .find(|p| p.pid == pid)
            .map_or(0, |p| p.last_section)
    }

    /// Section `number` of `pid`, created on first use. `pid` must have been
    /// inserted.
    pub fn section(&mut self, pid: u16, number: u8, last_section: u8) -> Option<&mut EcmSection> {
        let ep = self.pids.iter_mut().find(|p| p.pid == pid)?;
        ep.last_section = last_section;
        let pos = match ep.sections.iter().position(|s| s.number == number) {
            Some(pos) => pos,
            None => {
                ep.sections.push(EcmSection::new(number));
                ep.sections.len() - 1
            }
        };
        ep.sections.get_mut(pos)
    }

    pub fn lookup(&self, seq: u32) -> SeqLookup {
        for (pi, ep) in self.pids.iter().enumerate() {
            for (si, section) in ep.sections.iter().enumerate() {
                if section.seq != seq {
                    continue;
                }
                if section.resolved {
                    return SeqLookup::Answered;
                }
                if section.pending {
                    return SeqLookup::Pending(SectionRef { pid: pi, section: si });
                }
            }
        }
        SeqLookup::Unknown
    }

    pub fn get(&self, at: SectionRef) -> Option<&EcmSection> {
        self.pids.get(at.pid)?.sections.get(at.section)
    }

    /// Records the server's answer for a pending section. `keys` tells
    /// whether the answer carried keys; `resolved_elsewhere` whether another
    /// handle of the service already supplies them.
    pub fn reply(&mut self, at: SectionRef, keys: bool, resolved_elsewhere: bool) -> ReplyVerdict {
        let Some(es) = self.pids.get_mut(at.pid).and_then(|ep| ep.sections.get_mut(at.section)) else {
            return ReplyVerdict::Nok { go_idle: false };
        };
        es.pending = false;

        if keys {
            es.noks = 0;
            es.state = SectionState::Resolved;
            es.resolved = true;
            self.capid = Some(es.pid);
            self.state = EcmState::Valid;
            return ReplyVerdict::Keys;
        }

        es.noks = (es.noks + 1).min(MAX_NOKS);
        if es.state == SectionState::Forbidden {
            return ReplyVerdict::Nok { go_idle: false };
        }

        let mut go_idle = false;
        if es.noks >= MAX_NOKS {
            es.state = SectionState::Forbidden;
        } else if resolved_elsewhere {
            es.noks = MAX_NOKS;
            es.state = SectionState::Idle;
            go_idle = true;
        }
        let noks = es.noks;

        // other sections that never failed may still answer
        let mut hopeful = 0;
        for (pi, ep) in self.pids.iter().enumerate() {
            for (si, other) in ep.sections.iter().enumerate() {
                if (pi, si) == (at.pid, at.section) || other.noks != 0 {
                    continue;
                }
                if other.pending {
                    return ReplyVerdict::Nok { go_idle };
                }
                hopeful += 1;
            }
        }
        if hopeful > 0 && noks < MAX_NOKS {
            return ReplyVerdict::Nok { go_idle };
        }

        if let Some(es) = self.pids.get_mut(at.pid).and_then(|ep| ep.sections.get_mut(at.section)) {
            es.state = SectionState::Forbidden;
        }
        let usable = self
            .sections()
            .any(|s| matches!(s.state, SectionState::Unknown | SectionState::Resolved));
        if usable {
            return ReplyVerdict::Nok { go_idle };
        }
        self.state = EcmState::Reset;
        ReplyVerdict::Forbidden
    }

    /// Clears pending requests older than `timeout` so they can be sent
    /// again. Returns how many expired.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut expired = 0;
        for section in self.sections_mut() {
            let overdue = section
                .sent
                .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout);
            if section.pending && overdue {
                section.pending = false;
                section.forget();
                expired += 1;
            }
        }
        expired
    }

    fn sections(&self) -> impl Iterator<Item = &EcmSection> {
        self.pids.iter().flat_map(|ep| ep.sections.iter())
    }

    fn sections_mut(&mut self) -> impl Iterator<Item = &mut EcmSection> {
        self.pids.iter_mut().flat_map(|ep| ep.sections.iter_mut())
    }
}
