//! Console output, one line per shown port and a blank line between boards.

use std::collections::BTreeSet;
use std::io::{self, Write};

use tracing::warn;

use crate::acquisition::{PortReading, ReadingSink};

pub struct ConsoleSink<W> {
    out: W,
    /// Ports to print; empty prints all.
    show: BTreeSet<usize>,
    board: Option<usize>,
    cycle: Option<u64>,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout(show: impl IntoIterator<Item = usize>) -> Self {
        Self::new(io::stdout(), show)
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W, show: impl IntoIterator<Item = usize>) -> Self {
        Self { out, show: show.into_iter().collect(), board: None, cycle: None }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn shows(&self, id: usize) -> bool {
        self.show.is_empty() || self.show.contains(&id)
    }

    fn write_reading(&mut self, reading: &PortReading<'_>) -> io::Result<()> {
        let port = reading.port;
        if self.cycle != Some(reading.cycle) {
            self.cycle = Some(reading.cycle);
            self.board = None;
            writeln!(self.out, "cycle {} at {}", reading.cycle, reading.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        }
        let board = port.address().board();
        if self.board.is_some_and(|b| b != board) {
            writeln!(self.out)?;
        }
        self.board = Some(board);

        let chip = port.chip();
        write!(
            self.out,
            "port {:2} board {} chip #{} addr 0x{:02x} ch {} {:2} bits gain {}",
            port.id(),
            board,
            port.address().chip_index,
            chip.address,
            chip.channel.number(),
            port.resolution().bits(),
            port.gain().factor(),
        )?;
        match &reading.conversion {
            Some(c) => write!(
                self.out,
                ": raw {:7} adc {:9.6} mV LSB {:.7} mV volt {:8.4} trueV {:8.4}",
                c.code,
                c.adc_voltage * 1000.0,
                c.lsb * 1000.0,
                c.naive_voltage,
                c.true_voltage,
            )?,
            None => write!(self.out, ": no reading")?,
        }
        if let Some(avg) = reading.average {
            write!(self.out, " avg {avg:8.4}")?;
        }
        if let Some(rl) = reading.estimated_load {
            write!(self.out, " Rl {rl:.0}")?;
        }
        if let Some(status) = port.status() {
            write!(self.out, " [{status}]")?;
        }
        writeln!(self.out)
    }
}

impl<W: Write> ReadingSink for ConsoleSink<W> {
    fn publish(&mut self, reading: &PortReading<'_>) {
        if !self.shows(reading.port.id()) {
            return;
        }
        if let Err(e) = self.write_reading(reading) {
            warn!("cannot write reading: {e}");
        }
    }

    fn cycle_complete(&mut self, _cycle: u64) {
        if let Err(e) = writeln!(self.out).and_then(|_| self.out.flush()) {
            warn!("cannot write reading: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{Acquisition, LoopSettings};
    use crate::backend::fake::FakeBackend;
    use crate::backend::ChipChannel;
    use crate::registry::{PortDefaults, PortRegistry};
    use mcp342x::Channel;
    use test_log::test;

    fn run_once(show: &[usize]) -> String {
        let mut backend = FakeBackend::default();
        backend.set_codes(ChipChannel::new(0x68, Channel::Ch1), &[65536]);
        backend.failing_reads.insert(ChipChannel::new(0x69, Channel::Ch1));
        let registry = PortRegistry::build(9, &[0x68, 0x69, 0x6a], PortDefaults::default(), backend).unwrap();
        let mut acq = Acquisition::new(registry, LoopSettings::default());

        let mut sink = ConsoleSink::new(Vec::new(), show.iter().copied());
        acq.cycle(&mut sink).unwrap();
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn prints_selected_ports() {
        let text = run_once(&[1, 5]);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("cycle 1 at "));
        assert!(lines[1].starts_with("port  1 board 1 chip #0 addr 0x68 ch 1 18 bits gain 1: raw   65536"));
        assert!(lines[1].contains("trueV"));
        assert!(lines[2].starts_with("port  5 board 1 chip #1 addr 0x69 ch 1"));
        assert!(lines[2].ends_with(": no reading"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn separates_boards() {
        let text = run_once(&[]);
        let lines: Vec<&str> = text.lines().collect();
        // header, 8 ports of board 1, separator, port 9, trailing blank
        assert_eq!(lines.len(), 12);
        assert_eq!(lines[9], "");
        assert!(lines[10].starts_with("port  9 board 2"));
    }
}
