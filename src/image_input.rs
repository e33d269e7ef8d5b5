use kornia_image::{Image, ImageSize};

/// Image decoding error.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The upload carried no bytes.
    #[error("empty image payload")]
    Empty,

    /// The bytes are not an image format we can read.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// The decoded buffer does not fit a kornia image.
    #[error(transparent)]
    KorniaImage(#[from] kornia_image::ImageError),
}

/// Decode an encoded image (PNG, JPEG, ...) into an rgb8 image.
pub fn decode_image(bytes: &[u8]) -> Result<Image<u8, 3>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    let size = ImageSize {
        width: rgb.width() as usize,
        height: rgb.height() as usize,
    };
    Ok(Image::new(size, rgb.into_raw())?)
}
