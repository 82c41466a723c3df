//! Card emulator answering the SPI bring-up and read command set from a backing image.

#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, convert::Infallible, path::Path, rc::Rc};

use embedded_hal::blocking::spi::Transfer;
use sdspi_bus::{
    commands, crc16, tokens, CardState, CommandToken, DataCrcPolicy, Error, SdSpiBus, SdSpiConfig,
    BLOCK_SIZE,
};
use switch_hal::OutputSwitch;

pub type TestError = Error<Infallible, Infallible>;
pub type TestBus<Config> = SdSpiBus<CardSpi, CardSelect, Config>;

/// Small bounds, 32 blocks mapped.
pub struct TestConfig;

impl SdSpiConfig for TestConfig {
    const CMD_MAX_ATTEMPTS: usize = 8;
    const READ_R1_ATTEMPTS: usize = 16;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 4;
    const OP_COND_POLL_ATTEMPTS: usize = 8;
    const START_TOKEN_ATTEMPTS: usize = 32;
    const ADDRESSABLE_BLOCKS: u32 = 32;
    const DATA_CRC_POLICY: DataCrcPolicy = DataCrcPolicy::Reject;
}

/// As [`TestConfig`], keeping blocks with a bad CRC.
pub struct FlagConfig;

impl SdSpiConfig for FlagConfig {
    const CMD_MAX_ATTEMPTS: usize = 8;
    const READ_R1_ATTEMPTS: usize = 16;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 4;
    const OP_COND_POLL_ATTEMPTS: usize = 8;
    const START_TOKEN_ATTEMPTS: usize = 32;
    const ADDRESSABLE_BLOCKS: u32 = 32;
    const DATA_CRC_POLICY: DataCrcPolicy = DataCrcPolicy::AcceptAndFlag;
}

pub struct CardModel {
    image: Vec<u8>,
    selected: bool,
    select_cycles: usize,
    command: Vec<u8>,
    out: VecDeque<u8>,
    idle: bool,
    app_cmd: bool,
    acmd41_polls: usize,
    /// ACMD41 poll on which the card leaves idle state.
    pub ready_on_poll: usize,
    /// CMD0 replies that come back without the idle bit.
    pub cmd0_failures: usize,
    /// CMD8 replies flagged as CRC errors.
    pub cmd8_crc_errors: usize,
    /// Overrides the CMD8 echo.
    pub echo: Option<u32>,
    /// Never answer.
    pub silent: bool,
    /// Fill bytes before each R1.
    pub response_delay: usize,
    /// Fill bytes before the start token.
    pub token_delay: usize,
    /// Never send the start token.
    pub withhold_token: bool,
    /// Send a wrong data CRC.
    pub corrupt_crc: bool,
    /// Fixed R1 answered to ACMD41.
    pub acmd41_r1: Option<u8>,
    pub ocr: u32,
    pub commands: Vec<CommandToken>,
    pub blocks_read: Vec<u32>,
}

impl CardModel {
    fn new(image: Vec<u8>) -> Self {
        CardModel {
            image,
            selected: false,
            select_cycles: 0,
            command: Vec::new(),
            out: VecDeque::new(),
            idle: false,
            app_cmd: false,
            acmd41_polls: 0,
            ready_on_poll: 1,
            cmd0_failures: 0,
            cmd8_crc_errors: 0,
            echo: None,
            silent: false,
            response_delay: 1,
            token_delay: 2,
            withhold_token: false,
            corrupt_crc: false,
            acmd41_r1: None,
            ocr: 0x80FF_8000,
            commands: Vec::new(),
            blocks_read: Vec::new(),
        }
    }

    fn exchange(&mut self, incoming: u8) -> u8 {
        if !self.selected {
            return tokens::AVAILABLE;
        }

        let outgoing = self.out.pop_front().unwrap_or(tokens::AVAILABLE);

        if !self.command.is_empty() || incoming & 0xC0 == commands::CMD_BASE {
            self.command.push(incoming);
        }

        if self.command.len() == 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&self.command);
            self.command.clear();

            if let Some(token) = CommandToken::from_bytes(bytes) {
                self.commands.push(token);
                self.handle(token);
            }
        }

        outgoing
    }

    fn r1(&self) -> u8 {
        u8::from(self.idle)
    }

    fn respond(&mut self, bytes: &[u8]) {
        if self.silent {
            return;
        }
        self.out
            .extend(std::iter::repeat(tokens::AVAILABLE).take(self.response_delay));
        self.out.extend(bytes.iter().cloned());
    }

    fn handle(&mut self, token: CommandToken) {
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);

        match token.index() {
            commands::CMD0 if self.cmd0_failures > 0 => {
                self.cmd0_failures -= 1;
                self.respond(&[0x00]);
            }
            commands::CMD0 => {
                self.idle = true;
                self.acmd41_polls = 0;
                self.respond(&[0x01]);
            }
            commands::CMD8 if self.cmd8_crc_errors > 0 => {
                self.cmd8_crc_errors -= 1;
                self.respond(&[self.r1() | 0x08]);
            }
            commands::CMD8 => {
                let echo = self.echo.unwrap_or(token.argument() & 0xFFF).to_be_bytes();
                self.respond(&[self.r1(), echo[0], echo[1], echo[2], echo[3]]);
            }
            commands::CMD55 => {
                self.app_cmd = true;
                self.respond(&[self.r1()]);
            }
            commands::ACMD41 if app_cmd => {
                self.acmd41_polls += 1;
                if let Some(r1) = self.acmd41_r1 {
                    self.respond(&[r1]);
                    return;
                }
                if self.acmd41_polls >= self.ready_on_poll {
                    self.idle = false;
                }
                self.respond(&[self.r1()]);
            }
            commands::CMD58 => {
                let ocr = self.ocr.to_be_bytes();
                self.respond(&[self.r1(), ocr[0], ocr[1], ocr[2], ocr[3]]);
            }
            commands::CMD16 if token.argument() == BLOCK_SIZE as u32 => {
                self.respond(&[self.r1()]);
            }
            commands::CMD16 => self.respond(&[self.r1() | 0x40]),
            commands::CMD17 => self.read_block(token.argument()),
            _ => self.respond(&[self.r1() | 0x04]),
        }
    }

    fn read_block(&mut self, address: u32) {
        let start = address as usize;

        if self.idle || start + BLOCK_SIZE > self.image.len() {
            self.respond(&[self.r1() | 0x20]);
            return;
        }

        self.blocks_read.push(address);
        self.respond(&[0x00]);
        self.out
            .extend(std::iter::repeat(tokens::AVAILABLE).take(self.token_delay));

        if self.withhold_token {
            return;
        }

        let data = self.image[start..start + BLOCK_SIZE].to_vec();
        let mut crc = crc16(&data);
        if self.corrupt_crc {
            crc ^= 0xFFFF;
        }

        self.out.push_back(tokens::DATA_START_BLOCK);
        self.out.extend(data);
        self.out.extend(crc.to_be_bytes());
    }
}

/// Shared handle on the emulated card.
#[derive(Clone)]
pub struct CardEmulator(Rc<RefCell<CardModel>>);

impl CardEmulator {
    pub fn new(image: Vec<u8>) -> Self {
        CardEmulator(Rc::new(RefCell::new(CardModel::new(image))))
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn with_blocks(blocks: usize) -> Self {
        Self::new(pattern(blocks))
    }

    pub fn configure(&self, f: impl FnOnce(&mut CardModel)) {
        f(&mut self.0.borrow_mut());
    }

    pub fn spi(&self) -> CardSpi {
        CardSpi(self.clone())
    }

    pub fn cs(&self) -> CardSelect {
        CardSelect(self.clone())
    }

    pub fn bus<Config: SdSpiConfig>(&self) -> TestBus<Config> {
        SdSpiBus::new(self.spi(), self.cs())
    }

    pub fn selected(&self) -> bool {
        self.0.borrow().selected
    }

    pub fn select_cycles(&self) -> usize {
        self.0.borrow().select_cycles
    }

    pub fn acmd41_polls(&self) -> usize {
        self.0.borrow().acmd41_polls
    }

    pub fn command_indices(&self) -> Vec<u8> {
        self.0.borrow().commands.iter().map(|c| c.index()).collect()
    }

    pub fn commands(&self) -> Vec<CommandToken> {
        self.0.borrow().commands.clone()
    }

    pub fn blocks_read(&self) -> Vec<u32> {
        self.0.borrow().blocks_read.clone()
    }

    pub fn block(&self, index: usize) -> Vec<u8> {
        self.0.borrow().image[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE].to_vec()
    }
}

pub struct CardSpi(CardEmulator);

impl Transfer<u8> for CardSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = (self.0).0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

pub struct CardSelect(CardEmulator);

impl OutputSwitch for CardSelect {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        let mut card = (self.0).0.borrow_mut();
        if !card.selected {
            card.select_cycles += 1;
        }
        card.selected = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        let mut card = (self.0).0.borrow_mut();
        card.selected = false;
        card.command.clear();
        card.out.clear();
        Ok(())
    }
}

/// Image where every block differs.
pub fn pattern(blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| (i as u8).wrapping_mul(7) ^ (i / BLOCK_SIZE) as u8)
        .collect()
}

/// Little-endian word `word` of `block`.
pub fn word_of(block: &[u8], word: usize) -> u32 {
    u32::from_le_bytes([
        block[word * 4],
        block[word * 4 + 1],
        block[word * 4 + 2],
        block[word * 4 + 3],
    ])
}

/// Tick until the card is ready.
pub fn bring_up<Config: SdSpiConfig>(bus: &mut TestBus<Config>) -> Result<usize, TestError> {
    for ticks in 1..=10_000 {
        bus.tick()?;
        if bus.card_state() == CardState::Ready {
            return Ok(ticks);
        }
    }
    panic!("card never became ready");
}

/// Tick until the completion pulse.
pub fn until_valid<Config: SdSpiConfig>(bus: &mut TestBus<Config>) -> Result<usize, TestError> {
    for ticks in 1..=10_000 {
        bus.tick()?;
        if bus.valid() {
            return Ok(ticks);
        }
    }
    panic!("transfer never completed");
}
