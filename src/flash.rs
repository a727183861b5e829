//! Page by page firmware flashing.
//!
//! For each page, in ascending address order:
//! set address, erase, begin data write, stream data, commit, check CRC.
//! Flash is unlocked once before the first page and locked again on every
//! exit path, including failures part way through a page.

use core::ops::{Deref, DerefMut};

use crate::crc::Crc32;
use crate::firmware::{FirmwareImage, Page};
use crate::protocol::BootInfo;
use crate::session::Session;
use crate::transport::Transport;
use crate::Error;

/// Progress notifications emitted while flashing
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FlashEvent {
    /// Pre-flight passed, `pages` pages will be written
    Started { pages: u32 },
    Addressed { page: u32, address: u32 },
    Erased { page: u32, address: u32 },
    Written { page: u32, address: u32 },
    Verified { page: u32, address: u32, matched: bool },
}

/// Verification result for a single page
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PageReport {
    pub index: u32,
    pub address: u32,
    /// CRC computed over the full (padded) page
    pub crc: u32,
    pub verified: bool,
}

/// Result of a complete flashing run
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct FlashReport {
    pub pages: Vec<PageReport>,
}

impl FlashReport {
    /// Pages that failed CRC verification
    pub fn mismatches(&self) -> impl Iterator<Item = &PageReport> {
        self.pages.iter().filter(|p| !p.verified)
    }

    /// Whether every page verified
    pub fn is_verified(&self) -> bool {
        self.pages.iter().all(|p| p.verified)
    }
}

/// Drives a [`Session`] through flashing a complete image
#[derive(Debug, Clone)]
pub struct Flasher {
    crc: Crc32,
    bootloader_size: u32,
}

impl Flasher {
    /// Create a flasher reserving `bootloader_size` bytes for the bootloader
    pub fn new(bootloader_size: u32) -> Self {
        Self {
            crc: Crc32::new(),
            bootloader_size,
        }
    }

    /// Check the image fits the application region, returning the page count
    ///
    /// Performs no device interaction.
    pub fn preflight(&self, image: &FirmwareImage, info: &BootInfo) -> Result<u32, Error> {
        if info.page_size == 0 {
            return Err(Error::InvalidBootInfo("zero page size"));
        }

        let pages = image.page_count(info.page_size as usize) as u32;
        let available = info.available_pages(self.bootloader_size);

        debug!(
            "Image is {} bytes, {} pages ({} available)",
            image.len(),
            pages,
            available
        );

        if pages > available {
            error!(
                "Image requires {} pages, only {} available",
                pages, available
            );
            return Err(Error::ImageTooLarge { pages, available });
        }

        let len = pages as u64 * info.page_size as u64;
        if info.app_addr as u64 + len > u32::MAX as u64 + 1 {
            return Err(Error::InvalidBootInfo(
                "application region exceeds address space",
            ));
        }

        Ok(pages)
    }

    /// Flash `image` to the device, reporting progress through `on_event`
    ///
    /// CRC mismatches are recorded in the returned report and do not stop
    /// the run. Any other failure stops at the current page, the flash is
    /// locked, and the page error returned. A failed lock is reported only
    /// when no earlier error occurred.
    pub fn flash<T, F>(
        &self,
        session: &mut Session<T>,
        image: &FirmwareImage,
        info: &BootInfo,
        mut on_event: F,
    ) -> Result<FlashReport, Error>
    where
        T: Transport,
        F: FnMut(&FlashEvent),
    {
        let pages = self.preflight(image, info)?;

        if pages == 0 {
            warn!("Empty image, nothing to flash");
            return Ok(FlashReport::default());
        }

        on_event(&FlashEvent::Started { pages });

        let mut flash = Unlocked::new(session);

        let result = match flash.unlock() {
            Ok(_) => self.write_pages(&mut *flash, image, info, &mut on_event),
            Err(e) => Err(e),
        };

        let locked = flash.lock();

        let report = match (result, locked) {
            (Ok(r), Ok(())) => r,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(e)) => {
                error!("Failed to lock flash: {}", e);
                return Err(e);
            }
            (Err(e), Err(l)) => {
                warn!(
                    "Failed to lock flash after error, device may be left unlocked: {}",
                    l
                );
                return Err(e);
            }
        };

        info!(
            "Flashed {} pages, {} failed verification",
            report.pages.len(),
            report.mismatches().count()
        );

        Ok(report)
    }

    fn write_pages<T, F>(
        &self,
        session: &mut Session<T>,
        image: &FirmwareImage,
        info: &BootInfo,
        on_event: &mut F,
    ) -> Result<FlashReport, Error>
    where
        T: Transport,
        F: FnMut(&FlashEvent),
    {
        let mut report = FlashReport::default();

        for page in image.pages(info.page_size as usize, info.app_addr) {
            let r = self.write_page(session, &page, on_event)?;
            report.pages.push(r);
        }

        Ok(report)
    }

    fn write_page<T, F>(
        &self,
        session: &mut Session<T>,
        page: &Page,
        on_event: &mut F,
    ) -> Result<PageReport, Error>
    where
        T: Transport,
        F: FnMut(&FlashEvent),
    {
        let (index, address) = (page.index, page.address);

        session.set_page_address(address)?;
        info!("{}: 0x{:08x} set page address", index + 1, address);
        on_event(&FlashEvent::Addressed {
            page: index,
            address,
        });

        session.erase_page()?;
        info!("{}: 0x{:08x} erase page", index + 1, address);
        on_event(&FlashEvent::Erased {
            page: index,
            address,
        });

        session.begin_data_write()?;
        session.send_page(&page.data)?;
        session.commit_page()?;
        info!("{}: 0x{:08x} write page", index + 1, address);
        on_event(&FlashEvent::Written {
            page: index,
            address,
        });

        let crc = self.crc.compute(&page.data);
        let verified = session.check_crc(address, crc)?;
        if verified {
            info!("{}: 0x{:08x} check CRC32 OK", index + 1, address);
        } else {
            warn!("{}: 0x{:08x} check CRC32 failed", index + 1, address);
        }
        on_event(&FlashEvent::Verified {
            page: index,
            address,
            matched: verified,
        });

        Ok(PageReport {
            index,
            address,
            crc,
            verified,
        })
    }
}

/// Session with flash potentially unlocked
///
/// Locks the flash when released with [`Unlocked::lock`], or on drop if it
/// was never released.
struct Unlocked<'a, T: Transport> {
    session: &'a mut Session<T>,
    released: bool,
}

impl<'a, T: Transport> Unlocked<'a, T> {
    fn new(session: &'a mut Session<T>) -> Self {
        Self {
            session,
            released: false,
        }
    }

    fn lock(mut self) -> Result<(), Error> {
        self.released = true;
        self.session.lock()
    }
}

impl<'a, T: Transport> Deref for Unlocked<'a, T> {
    type Target = Session<T>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<'a, T: Transport> DerefMut for Unlocked<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<'a, T: Transport> Drop for Unlocked<'a, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(e) = self.session.lock() {
            warn!("Failed to lock flash on exit: {}", e);
        }
    }
}
