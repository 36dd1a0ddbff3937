//! Frame to host-array translation.
//!
//! Exported arrays always own a copy of the pixel bytes. Driver buffers are
//! recycled on the next release/acquire cycle, so nothing here may alias them.

use crate::types::{Frame, PixelFormat};
use crate::{Kinect2Error, Result};

/// Element type of an exported array.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    F32 = 3,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 => 4,
            ElementType::F32 => 4,
        }
    }

    fn unsigned_of_width(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(ElementType::U8),
            2 => Some(ElementType::U16),
            4 => Some(ElementType::U32),
            _ => None,
        }
    }
}

/// A row-major array: `shape` is `(height, width)` or `(height, width, channels)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    pub shape: Vec<usize>,
    pub element: ElementType,
    pub data: Vec<u8>,
}

impl HostArray {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements as `f32`, or `None` if this is not a float array.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.element != ElementType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect(),
        )
    }

    /// Elements as `u16`, or `None` if this is not a 16-bit array.
    pub fn to_u16(&self) -> Option<Vec<u16>> {
        if self.element != ElementType::U16 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(bytemuck::pod_read_unaligned::<u16>)
                .collect(),
        )
    }

    /// Raw bytes of an 8-bit array.
    pub fn as_u8(&self) -> Option<&[u8]> {
        (self.element == ElementType::U8).then_some(self.data.as_slice())
    }
}

/// Copy `frame` into a new [`HostArray`].
pub fn export_frame(frame: &Frame) -> Result<HostArray> {
    let (shape, element) = match frame.format {
        PixelFormat::Float if frame.bytes_per_pixel == 4 => {
            (vec![frame.height, frame.width], ElementType::F32)
        }
        PixelFormat::Bgrx | PixelFormat::Rgbx if frame.bytes_per_pixel == 4 => {
            (vec![frame.height, frame.width, 4], ElementType::U8)
        }
        PixelFormat::Gray => {
            let element = ElementType::unsigned_of_width(frame.bytes_per_pixel)
                .ok_or(Kinect2Error::UnexportableFormat(frame.format))?;
            (vec![frame.height, frame.width], element)
        }
        other => return Err(Kinect2Error::UnexportableFormat(other)),
    };

    let len = frame.byte_len();
    let bytes = frame
        .data
        .get(..len)
        .ok_or(Kinect2Error::UnexportableFormat(frame.format))?;

    Ok(HostArray {
        shape,
        element,
        data: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEPTH_HEIGHT, DEPTH_WIDTH};

    #[test]
    fn test_float_exports_as_2d_f32() {
        let mut frame = Frame::new(3, 2, 4, PixelFormat::Float);
        let values: [f32; 6] = [0.0, 1.5, 2.0, 3.0, 4.25, 5.0];
        frame.data.copy_from_slice(bytemuck::cast_slice(&values[..]));

        let arr = export_frame(&frame).unwrap();
        assert_eq!(arr.shape, vec![2, 3]);
        assert_eq!(arr.element, ElementType::F32);
        assert_eq!(arr.to_f32().unwrap(), values.to_vec());
        assert!(arr.as_u8().is_none());
    }

    #[test]
    fn test_color_exports_channels_last() {
        let frame = Frame::new(DEPTH_WIDTH, DEPTH_HEIGHT, 4, PixelFormat::Bgrx);
        let arr = export_frame(&frame).unwrap();
        assert_eq!(arr.shape, vec![424, 512, 4]);
        assert_eq!(arr.ndim(), 3);
        assert_eq!(arr.element, ElementType::U8);
        assert_eq!(arr.len(), 512 * 424 * 4);
        assert_eq!(arr.element_count() * arr.element.size(), arr.len());
    }

    #[test]
    fn test_gray_uses_bytes_per_pixel() {
        let mut frame = Frame::new(2, 2, 2, PixelFormat::Gray);
        frame.data.copy_from_slice(bytemuck::cast_slice(&[1u16, 2, 3, 65535][..]));

        let arr = export_frame(&frame).unwrap();
        assert_eq!(arr.shape, vec![2, 2]);
        assert_eq!(arr.element, ElementType::U16);
        assert_eq!(arr.to_u16().unwrap(), vec![1, 2, 3, 65535]);

        let gray8 = export_frame(&Frame::new(5, 1, 1, PixelFormat::Gray)).unwrap();
        assert_eq!(gray8.element, ElementType::U8);

        let odd = Frame::new(2, 2, 3, PixelFormat::Gray);
        assert!(matches!(
            export_frame(&odd),
            Err(Kinect2Error::UnexportableFormat(PixelFormat::Gray))
        ));
    }

    #[test]
    fn test_raw_and_invalid_are_unexportable() {
        for format in [PixelFormat::Raw, PixelFormat::Invalid] {
            let frame = Frame::new(4, 4, 1, format);
            assert!(matches!(
                export_frame(&frame),
                Err(Kinect2Error::UnexportableFormat(f)) if f == format
            ));
        }
    }

    #[test]
    fn test_export_does_not_alias_source() {
        let mut frame = Frame::new(2, 1, 4, PixelFormat::Bgrx);
        frame.data.fill(7);
        let arr = export_frame(&frame).unwrap();
        frame.data.fill(0);
        assert!(arr.data.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let mut frame = Frame::new(4, 4, 4, PixelFormat::Float);
        frame.data.truncate(10);
        assert!(export_frame(&frame).is_err());
    }
}
