use nom::combinator::map;
use nom::number::streaming::{be_i16, be_u16};
use nom::IResult;

/// Sub-parsers for scaled wire fields, referenced by name from nom-derive
/// structs in the seplos payload decoders.
pub struct Utils;

impl Utils {
    pub fn be_u16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_u16, |v| v as f64 / 10.0)(input)
    }

    pub fn be_u16_div100(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_u16, |v| v as f64 / 100.0)(input)
    }

    pub fn be_i16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_i16, |v| v as f64 / 10.0)(input)
    }

    pub fn be_i16_div100(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_i16, |v| v as f64 / 100.0)(input)
    }

    pub fn be_i16_f64(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_i16, |v| v as f64)(input)
    }

    /// 0.1 K reading to °C.
    pub fn be_u16_deci_kelvin(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_u16, |v| (v as f64 - 2731.0) / 10.0)(input)
    }

    /// Inter-pack temperature fields arrive without the kelvin offset; the
    /// upstream implementation re-applies it before scaling.
    pub fn be_u16_offset_deci_kelvin(input: &[u8]) -> IResult<&[u8], f64> {
        map(be_u16, |v| (v as f64 + 2731.0) / 10.0)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_parsers() {
        assert_eq!(Utils::be_u16_div100(&[0x01, 0x00]).unwrap().1, 2.56);
        assert_eq!(Utils::be_i16_div100(&[0xFF, 0x9C]).unwrap().1, -1.0);
        assert_eq!(Utils::be_u16_deci_kelvin(&[0x0B, 0xB8]).unwrap().1, 26.9);
    }
}
