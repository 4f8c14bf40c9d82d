#![forbid(unsafe_code)]

//! Fixed category shelf served to clients and consulted by the intent
//! scorer. Keywords are deliberately broad; matching is substring-based.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Category {
    pub slug: &'static str,
    pub label: &'static str,
    /// Search query backing the category page; `None` means plain trending.
    pub query: Option<&'static str>,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
}

pub const CATEGORIES: &[Category] = &[
    Category {
        slug: "all",
        label: "All",
        query: None,
        description: "Trending videos from around the world",
        keywords: &["trending", "viral", "popular"],
    },
    Category {
        slug: "trending",
        label: "Trending",
        query: Some("trending"),
        description: "What's hot right now",
        keywords: &["trending", "viral", "hot"],
    },
    Category {
        slug: "music",
        label: "Music",
        query: Some("music"),
        description: "Music videos, songs, and performances",
        keywords: &["music", "songs", "music videos"],
    },
    Category {
        slug: "gaming",
        label: "Gaming",
        query: Some("gaming"),
        description: "Gaming content, Let's Plays, and esports",
        keywords: &["gaming", "video games", "esports"],
    },
    Category {
        slug: "news",
        label: "News",
        query: Some("news"),
        description: "News and current events",
        keywords: &["news", "current events"],
    },
    Category {
        slug: "sports",
        label: "Sports",
        query: Some("sports highlights"),
        description: "Sports highlights and analysis",
        keywords: &["sports", "highlights", "athletics"],
    },
    Category {
        slug: "entertainment",
        label: "Entertainment",
        query: Some("entertainment"),
        description: "Entertainment and pop culture",
        keywords: &["entertainment", "pop culture"],
    },
    Category {
        slug: "podcasts",
        label: "Podcasts",
        query: Some("podcast"),
        description: "Podcasts and talk shows",
        keywords: &["podcast", "talk show", "interview"],
    },
    Category {
        slug: "comedy",
        label: "Comedy",
        query: Some("comedy"),
        description: "Comedy sketches and stand-up",
        keywords: &["comedy", "funny", "humor"],
    },
    Category {
        slug: "education",
        label: "Education",
        query: Some("education"),
        description: "Educational videos and tutorials",
        keywords: &["education", "learning", "tutorials"],
    },
    Category {
        slug: "science",
        label: "Science & Tech",
        query: Some("science technology"),
        description: "Science and technology content",
        keywords: &["science", "technology", "tech"],
    },
    Category {
        slug: "film",
        label: "Film & Animation",
        query: Some("film animation trailer"),
        description: "Movies, animation, and trailers",
        keywords: &["movies", "animation", "trailers"],
    },
    Category {
        slug: "howto",
        label: "How-to & DIY",
        query: Some("how to diy tutorial"),
        description: "How-to guides and DIY projects",
        keywords: &["how to", "diy", "tutorial"],
    },
    Category {
        slug: "travel",
        label: "Travel",
        query: Some("travel vlog"),
        description: "Travel vlogs and destination guides",
        keywords: &["travel", "vlog", "adventure"],
    },
    Category {
        slug: "fashion",
        label: "Fashion & Beauty",
        query: Some("fashion beauty"),
        description: "Fashion trends and beauty tips",
        keywords: &["fashion", "beauty", "style"],
    },
    Category {
        slug: "lofi",
        label: "Lo-Fi",
        query: Some("lofi chill beats"),
        description: "Chill beats and ambient music",
        keywords: &["lofi", "chill", "ambient", "beats"],
    },
    Category {
        slug: "live",
        label: "Live",
        query: Some("live stream"),
        description: "Live streams and broadcasts",
        keywords: &["live", "streaming"],
    },
];

pub fn find_category(slug: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|category| category.slug == slug)
}
