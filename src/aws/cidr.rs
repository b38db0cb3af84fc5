//! IPv4 CIDR parsing and sequential subnet allocation.
//!
//! Subnets are carved out of the VPC block in declaration order: callers
//! request blocks of a given prefix length and receive the next aligned
//! range. Alignment is to the requested block size, so mixing prefix lengths
//! (e.g. /24 public subnets followed by /20 private subnets) skips the
//! padding a real router would require.

use crate::aws::Error;
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// An IPv4 CIDR block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CidrBlock {
    addr: u32,
    prefix: u8,
}

impl CidrBlock {
    /// Number of addresses covered by this block
    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    /// First address of the block as an integer
    fn start(&self) -> u32 {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for CidrBlock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidCidr(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        let addr = u32::from(addr);
        if addr & !mask != 0 {
            // Host bits set below the prefix, e.g. 10.0.1.0/16
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.prefix)
    }
}

/// Allocates consecutive subnets from a VPC block
pub struct SubnetAllocator {
    base: CidrBlock,
    cursor: u64,
}

impl SubnetAllocator {
    pub fn new(base: CidrBlock) -> Self {
        let cursor = u64::from(base.start());
        Self { base, cursor }
    }

    /// Returns the next free block of the requested prefix length
    pub fn next(&mut self, prefix: u8) -> Result<CidrBlock, Error> {
        let exhausted = || Error::SubnetSpaceExhausted {
            cidr: self.base.to_string(),
            mask: prefix,
        };
        if prefix <= self.base.prefix || prefix > 32 {
            return Err(Error::InvalidSubnetMask {
                mask: prefix,
                vpc_prefix: self.base.prefix,
            });
        }
        let size = 1u64 << (32 - prefix);
        let start = self.cursor.div_ceil(size) * size;
        let end = start.checked_add(size).ok_or_else(exhausted)?;
        if end > u64::from(self.base.start()) + self.base.size() {
            return Err(exhausted());
        }
        self.cursor = end;
        Ok(CidrBlock {
            addr: start as u32,
            prefix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let block: CidrBlock = "10.0.0.0/16".parse().unwrap();
        assert_eq!(block.prefix(), 16);
        assert_eq!(block.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<CidrBlock>().is_err());
        assert!("10.0.0.0/33".parse::<CidrBlock>().is_err());
        assert!("300.0.0.0/8".parse::<CidrBlock>().is_err());
        assert!("10.0.1.0/16".parse::<CidrBlock>().is_err());
    }

    #[test]
    fn allocates_two_public_then_two_private_subnets() {
        let vpc: CidrBlock = "10.0.0.0/16".parse().unwrap();
        let mut allocator = SubnetAllocator::new(vpc);
        assert_eq!(allocator.next(24).unwrap().to_string(), "10.0.0.0/24");
        assert_eq!(allocator.next(24).unwrap().to_string(), "10.0.1.0/24");
        // Private /20s start at the next /20-aligned boundary
        assert_eq!(allocator.next(20).unwrap().to_string(), "10.0.16.0/20");
        assert_eq!(allocator.next(20).unwrap().to_string(), "10.0.32.0/20");
    }

    #[test]
    fn exhausts_small_blocks() {
        let vpc: CidrBlock = "10.0.0.0/24".parse().unwrap();
        let mut allocator = SubnetAllocator::new(vpc);
        assert!(allocator.next(25).is_ok());
        assert!(allocator.next(25).is_ok());
        assert!(matches!(
            allocator.next(25),
            Err(Error::SubnetSpaceExhausted { .. })
        ));
    }

    #[test]
    fn rejects_mask_wider_than_base() {
        let vpc: CidrBlock = "10.0.0.0/24".parse().unwrap();
        let mut allocator = SubnetAllocator::new(vpc);
        assert!(matches!(
            allocator.next(16),
            Err(Error::InvalidSubnetMask { .. })
        ));
    }
}
