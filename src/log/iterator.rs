//! Loggable Iterator
//!
//! Lazy, sequential iteration over log records, skipping file padding and
//! gaps left by deleted files.

use crate::error::Result;

use super::loggable::Loggable;
use super::manager::Log;
use super::HEADER_SIZE;

/// Iterator over loggables in address order
pub struct LoggableIterator<'a> {
    log: &'a Log,
    /// Address of the next frame to read
    address: u64,
    /// Stop before this address
    end: u64,
    /// One loggable of lookahead for `peek`/`next_if`
    peeked: Option<Loggable>,
    /// Set after an error; the iterator is fused from then on
    failed: bool,
}

impl<'a> LoggableIterator<'a> {
    pub(super) fn new(log: &'a Log, address: u64, end: u64) -> Self {
        Self {
            log,
            address,
            end,
            peeked: None,
            failed: false,
        }
    }

    /// Address the iterator will read next (ignores a peeked loggable)
    pub fn position(&self) -> u64 {
        match &self.peeked {
            Some(loggable) => loggable.address,
            None => self.address,
        }
    }

    /// Look at the next loggable without consuming it
    pub fn peek(&mut self) -> Result<Option<&Loggable>> {
        if self.peeked.is_none() {
            self.peeked = self.advance()?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Consume the next loggable only if it satisfies `predicate`
    pub fn next_if<F>(&mut self, predicate: F) -> Result<Option<Loggable>>
    where
        F: FnOnce(&Loggable) -> bool,
    {
        match self.peek()? {
            Some(loggable) if predicate(loggable) => Ok(self.peeked.take()),
            _ => Ok(None),
        }
    }

    fn advance(&mut self) -> Result<Option<Loggable>> {
        let file_size = self.log.file_length_bound();
        loop {
            if self.failed || self.address >= self.end {
                return Ok(None);
            }

            let file_address = self.log.file_address_of(self.address);
            if !self.log.has_file(file_address) {
                match self.log.next_file_address(file_address) {
                    Some(next) => {
                        self.address = next;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            if self.address - file_address + HEADER_SIZE as u64 > file_size {
                self.address = file_address + file_size;
                continue;
            }

            match self.log.read_frame(self.address) {
                Ok(None) => {
                    self.address = file_address + file_size;
                }
                Ok(Some(loggable)) => {
                    self.address = loggable.end_address();
                    return Ok(Some(loggable));
                }
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
    }
}

impl<'a> Iterator for LoggableIterator<'a> {
    type Item = Result<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(loggable) = self.peeked.take() {
            return Some(Ok(loggable));
        }
        self.advance().transpose()
    }
}
