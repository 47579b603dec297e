use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DNSResourceType {
    #[default]
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    HINFO,
    MX,
    TXT,
    AAAA,
    SRV,
    NAPTR,
    OPT,
    DS,
    RRSIG,
    NSEC,
    DNSKEY,
    SVCB,
    HTTPS,
    CAA,
    AXFR,
    IXFR,
    ANY,
    Unknown(u16),
}

impl From<u16> for DNSResourceType {
    fn from(value: u16) -> Self {
        match value {
            1 => DNSResourceType::A,
            2 => DNSResourceType::NS,
            5 => DNSResourceType::CNAME,
            6 => DNSResourceType::SOA,
            12 => DNSResourceType::PTR,
            13 => DNSResourceType::HINFO,
            15 => DNSResourceType::MX,
            16 => DNSResourceType::TXT,
            28 => DNSResourceType::AAAA,
            33 => DNSResourceType::SRV,
            35 => DNSResourceType::NAPTR,
            41 => DNSResourceType::OPT,
            43 => DNSResourceType::DS,
            46 => DNSResourceType::RRSIG,
            47 => DNSResourceType::NSEC,
            48 => DNSResourceType::DNSKEY,
            64 => DNSResourceType::SVCB,
            65 => DNSResourceType::HTTPS,
            252 => DNSResourceType::AXFR,
            251 => DNSResourceType::IXFR,
            255 => DNSResourceType::ANY,
            257 => DNSResourceType::CAA,
            other => DNSResourceType::Unknown(other),
        }
    }
}

impl From<DNSResourceType> for u16 {
    fn from(value: DNSResourceType) -> Self {
        match value {
            DNSResourceType::A => 1,
            DNSResourceType::NS => 2,
            DNSResourceType::CNAME => 5,
            DNSResourceType::SOA => 6,
            DNSResourceType::PTR => 12,
            DNSResourceType::HINFO => 13,
            DNSResourceType::MX => 15,
            DNSResourceType::TXT => 16,
            DNSResourceType::AAAA => 28,
            DNSResourceType::SRV => 33,
            DNSResourceType::NAPTR => 35,
            DNSResourceType::OPT => 41,
            DNSResourceType::DS => 43,
            DNSResourceType::RRSIG => 46,
            DNSResourceType::NSEC => 47,
            DNSResourceType::DNSKEY => 48,
            DNSResourceType::SVCB => 64,
            DNSResourceType::HTTPS => 65,
            DNSResourceType::AXFR => 252,
            DNSResourceType::IXFR => 251,
            DNSResourceType::ANY => 255,
            DNSResourceType::CAA => 257,
            DNSResourceType::Unknown(code) => code,
        }
    }
}

impl FromStr for DNSResourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u16>() {
            return match DNSResourceType::from(code) {
                DNSResourceType::Unknown(_) => Err(()),
                qtype => Ok(qtype),
            };
        }
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(DNSResourceType::A),
            "NS" => Ok(DNSResourceType::NS),
            "CNAME" => Ok(DNSResourceType::CNAME),
            "SOA" => Ok(DNSResourceType::SOA),
            "PTR" => Ok(DNSResourceType::PTR),
            "HINFO" => Ok(DNSResourceType::HINFO),
            "MX" => Ok(DNSResourceType::MX),
            "TXT" => Ok(DNSResourceType::TXT),
            "AAAA" => Ok(DNSResourceType::AAAA),
            "SRV" => Ok(DNSResourceType::SRV),
            "NAPTR" => Ok(DNSResourceType::NAPTR),
            "DS" => Ok(DNSResourceType::DS),
            "RRSIG" => Ok(DNSResourceType::RRSIG),
            "NSEC" => Ok(DNSResourceType::NSEC),
            "DNSKEY" => Ok(DNSResourceType::DNSKEY),
            "SVCB" => Ok(DNSResourceType::SVCB),
            "HTTPS" => Ok(DNSResourceType::HTTPS),
            "CAA" => Ok(DNSResourceType::CAA),
            "ANY" => Ok(DNSResourceType::ANY),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DNSResourceClass {
    #[default]
    IN,
    CS,
    CH,
    HS,
    ANY,
    Unknown(u16),
}

impl From<u16> for DNSResourceClass {
    fn from(value: u16) -> Self {
        match value {
            1 => DNSResourceClass::IN,
            2 => DNSResourceClass::CS,
            3 => DNSResourceClass::CH,
            4 => DNSResourceClass::HS,
            255 => DNSResourceClass::ANY,
            other => DNSResourceClass::Unknown(other),
        }
    }
}

impl From<DNSResourceClass> for u16 {
    fn from(value: DNSResourceClass) -> Self {
        match value {
            DNSResourceClass::IN => 1,
            DNSResourceClass::CS => 2,
            DNSResourceClass::CH => 3,
            DNSResourceClass::HS => 4,
            DNSResourceClass::ANY => 255,
            DNSResourceClass::Unknown(code) => code,
        }
    }
}

/// Response codes used by the handler's failure policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
}

impl ResponseCode {
    pub fn to_u8(self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NxDomain => 3,
        }
    }
}
